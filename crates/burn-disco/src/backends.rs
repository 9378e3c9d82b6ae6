//! Backend selection
//!
//! Sampling needs autodiff, so every [`DefaultBackend`] here is wrapped in
//! [`Autodiff`]. Enable one backend via feature flags:
//!
//! - `ndarray`: CPU backend (no GPU required)
//! - `tch`: libtorch backend (CUDA, MPS)
//! - `wgpu`: WebGPU backend
//! - `cuda`: native CUDA backend
//!
//! ```ignore
//! use burn_disco::backends::{default_device, DefaultBackend};
//!
//! let device = default_device();
//! let runner = burn_disco::Runner::<DefaultBackend>::new(config, env, device)?;
//! ```

#[allow(unused_imports)]
use burn::backend::Autodiff;

#[cfg(feature = "ndarray")]
pub use burn_ndarray::{NdArray, NdArrayDevice};

#[cfg(feature = "tch")]
pub use burn_tch::{LibTorch, LibTorchDevice};

#[cfg(feature = "wgpu")]
pub use burn_wgpu::{Wgpu, WgpuDevice};

#[cfg(feature = "cuda")]
pub use burn_cuda::{Cuda, CudaDevice};

#[cfg(feature = "ndarray")]
pub type DefaultBackend = Autodiff<NdArray>;

#[cfg(all(feature = "tch", not(feature = "ndarray")))]
pub type DefaultBackend = Autodiff<LibTorch>;

#[cfg(all(feature = "wgpu", not(any(feature = "ndarray", feature = "tch"))))]
pub type DefaultBackend = Autodiff<Wgpu>;

#[cfg(all(
    feature = "cuda",
    not(any(feature = "ndarray", feature = "tch", feature = "wgpu"))
))]
pub type DefaultBackend = Autodiff<Cuda>;

/// Default device for the enabled backend
#[cfg(feature = "ndarray")]
pub fn default_device() -> NdArrayDevice {
    NdArrayDevice::default()
}

/// Default device for the enabled backend
#[cfg(all(feature = "tch", not(feature = "ndarray")))]
pub fn default_device() -> LibTorchDevice {
    if burn_tch::is_cuda_available() {
        LibTorchDevice::Cuda(0)
    } else {
        LibTorchDevice::Cpu
    }
}

/// Default device for the enabled backend
#[cfg(all(feature = "wgpu", not(any(feature = "ndarray", feature = "tch"))))]
pub fn default_device() -> WgpuDevice {
    WgpuDevice::default()
}

/// Default device for the enabled backend
#[cfg(all(
    feature = "cuda",
    not(any(feature = "ndarray", feature = "tch", feature = "wgpu"))
))]
pub fn default_device() -> CudaDevice {
    CudaDevice::default()
}
