pub mod candle_utils;

pub use candle_utils::select_device;
