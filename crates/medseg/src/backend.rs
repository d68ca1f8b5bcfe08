//! Compute backend chosen at build time.
//!
//! Enable `cuda` or `wgpu` to run the tensor work on a GPU; without either the
//! pipeline runs on the `ndarray` CPU backend. `cuda` takes precedence.

use burn::backend::Autodiff;
use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "cuda")] {
        pub type SelectedBackend = burn::backend::Cuda;
        pub type SelectedDevice = burn::backend::cuda::CudaDevice;
        const BACKEND_NAME: &str = "CUDA (NVIDIA GPU)";
    } else if #[cfg(feature = "wgpu")] {
        pub type SelectedBackend = burn::backend::Wgpu;
        pub type SelectedDevice = burn::backend::wgpu::WgpuDevice;
        const BACKEND_NAME: &str = "WGPU (GPU)";
    } else {
        pub type SelectedBackend = burn::backend::NdArray;
        pub type SelectedDevice = burn::backend::ndarray::NdArrayDevice;
        const BACKEND_NAME: &str = "NdArray (CPU)";
    }
}

/// Backend used when model and optimizer state are restored for training.
pub type TrainingBackend = Autodiff<SelectedBackend>;

/// Default device of the selected backend.
pub fn create_device() -> SelectedDevice {
    SelectedDevice::default()
}

/// Human-readable name of the selected backend, for logs and `medseg info`.
pub const fn get_backend_name() -> &'static str {
    BACKEND_NAME
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(any(feature = "cuda", feature = "wgpu")))]
    #[test]
    fn cpu_backend_is_the_default() {
        assert_eq!(get_backend_name(), "NdArray (CPU)");
        assert_eq!(create_device(), SelectedDevice::Cpu);
    }
}
