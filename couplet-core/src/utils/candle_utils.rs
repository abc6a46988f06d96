use anyhow::Result;
use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};

/// Picks CUDA, then Metal, then CPU, unless `force_cpu` is set.
pub fn select_device(force_cpu: bool) -> Result<Device> {
    let device = if force_cpu {
        Device::Cpu
    } else if cuda_is_available() {
        Device::new_cuda(0)?
    } else if metal_is_available() {
        Device::new_metal(0)?
    } else {
        Device::Cpu
    };
    tracing::debug!("Decoding on {}", device_label(&device));
    Ok(device)
}

pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}
