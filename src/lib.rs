//! Roger Renderer Library
//!
//! Audio render core: sample format conversion, device feeding,
//! DSP chain and clock slaving.

pub mod audio;
pub mod decode;
pub mod dsp;
pub mod renderer;
