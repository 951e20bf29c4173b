#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod constants;
mod device;
mod traits;

pub mod conversation;
pub mod llava;

pub use candle_core::{DType, Device};
pub use constants::*;
pub use device::{device, effective_dtype, parse_dtype};
pub use image;
pub use tokenizers;
pub use traits::*;
