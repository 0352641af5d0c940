//! 文件解码（演示程序的样本来源）

mod decoder;

pub use decoder::{AudioDecoder, AudioInfo, DecodeError};
