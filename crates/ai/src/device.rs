use anyhow::bail;
use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    DType, Device,
};
use tracing::{info, warn};

/// Picks the first accelerator compiled in, unless `cpu` is forced.
pub fn device(cpu: bool) -> anyhow::Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }

    if cuda_is_available() {
        info!("using cuda device");
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        info!("using metal device");
        Ok(Device::new_metal(0)?)
    } else {
        warn!("no accelerator available, running on cpu");
        Ok(Device::Cpu)
    }
}

/// Accepts both candle names (`f16`) and the `torch_dtype` strings found in model configs.
pub fn parse_dtype(dtype: &str) -> anyhow::Result<DType> {
    let dtype = match dtype {
        "f32" | "float32" => DType::F32,
        "f16" | "float16" => DType::F16,
        "bf16" | "bfloat16" => DType::BF16,
        _ => bail!("unsupported dtype: {}", dtype),
    };
    Ok(dtype)
}

/// Half precision matmuls are not available on every cpu backend.
pub fn effective_dtype(dtype: DType, device: &Device) -> DType {
    if device.is_cpu() && matches!(dtype, DType::F16 | DType::BF16) {
        info!("cpu device, falling back from {:?} to f32", dtype);
        DType::F32
    } else {
        dtype
    }
}
