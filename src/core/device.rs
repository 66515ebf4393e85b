use crate::core::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;
use tracing::info;

/// Picks Metal, then CUDA, then CPU. `cpu` forces the CPU.
pub fn select_device(cpu: bool) -> Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    if metal_is_available() {
        info!("using metal device");
        return Ok(Device::new_metal(0)?);
    }
    if cuda_is_available() {
        info!("using cuda device");
        return Ok(Device::new_cuda(0)?);
    }
    Ok(Device::Cpu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forced_cpu() {
        assert!(select_device(true).unwrap().is_cpu());
    }
}
