use ort::execution_providers::{
    ArenaExtendStrategy, CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
    ExecutionProviderDispatch,
};

use crate::Device;

/// ONNX Runtime session tuning for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub device: Device,
    pub intra_threads: usize,
    pub inter_threads: usize,
    /// Keep freed CPU buffers in the arena instead of returning them.
    pub cpu_arena: bool,
    pub memory_pattern: bool,
    /// Grow the CUDA arena by exactly what a request needs.
    pub arena_same_as_requested: bool,
    pub gpu_memory_limit: Option<usize>,
}

impl RuntimeConfig {
    /// Conservative settings that keep peak memory close to the working set.
    pub fn for_device(device: Device, threads: Option<usize>) -> Self {
        let intra_threads = threads.unwrap_or(match device {
            Device::Cpu => num_cpus::get(),
            Device::Cuda | Device::CoreMl => 1,
        });
        Self {
            device,
            intra_threads: intra_threads.max(1),
            inter_threads: 1,
            cpu_arena: false,
            memory_pattern: false,
            arena_same_as_requested: true,
            gpu_memory_limit: None,
        }
    }

    /// Trade memory for throughput: arenas, memory patterns and every core.
    pub fn high_memory(device: Device, threads: Option<usize>) -> Self {
        Self {
            intra_threads: threads.unwrap_or_else(num_cpus::get).max(1),
            inter_threads: num_cpus::get_physical().max(1),
            cpu_arena: true,
            memory_pattern: true,
            arena_same_as_requested: false,
            ..Self::for_device(device, threads)
        }
    }

    /// Devices for ONNX Runtime's `memory.enable_memory_arena_shrinkage` run
    /// option. `None` when no arena allocator is in play.
    pub fn arena_shrinkage(&self) -> Option<&'static str> {
        match (self.device, self.cpu_arena) {
            (Device::Cuda, true) => Some("cpu:0;gpu:0"),
            (Device::Cuda, false) => Some("gpu:0"),
            (_, true) => Some("cpu:0"),
            (_, false) => None,
        }
    }

    pub(crate) fn execution_provider(&self) -> ExecutionProviderDispatch {
        match self.device {
            Device::Cuda => {
                let strategy = if self.arena_same_as_requested {
                    ArenaExtendStrategy::SameAsRequested
                } else {
                    ArenaExtendStrategy::NextPowerOfTwo
                };
                let mut provider = CUDAExecutionProvider::default()
                    .with_device_id(0)
                    .with_arena_extend_strategy(strategy);
                if let Some(limit) = self.gpu_memory_limit {
                    provider = provider.with_memory_limit(limit);
                }
                provider.build().error_on_failure()
            }
            Device::CoreMl => CoreMLExecutionProvider::default().build().error_on_failure(),
            Device::Cpu => CPUExecutionProvider::default()
                .with_arena_allocator(self.cpu_arena)
                .build(),
        }
    }
}
