//! Native runtime for pre-aggregation, running device streams on a thread
//! pool.
pub mod device;

use std::sync::Arc;

use preagg_core::chunk::RowSource;
use preagg_core::config::PreAggConfig;
use preagg_core::dispatch::{PreAggExecutor, PreAggStream};
use preagg_core::kernels::ReductionKernels;
use preagg_core::plan::PlanEstimates;
use preagg_error::Result;

pub use self::device::{DeviceOptions, ThreadedDevice};

/// Executor running pre-aggregations on a threaded device.
#[derive(Debug, Clone)]
pub struct NativeExecutor {
    device: Arc<ThreadedDevice>,
    executor: PreAggExecutor,
}

impl NativeExecutor {
    /// Create an executor with a stream per cpu.
    pub fn try_new(config: PreAggConfig) -> Result<Self> {
        Self::try_new_with_options(DeviceOptions::default(), config)
    }

    pub fn try_new_with_options(options: DeviceOptions, config: PreAggConfig) -> Result<Self> {
        let device = Arc::new(ThreadedDevice::try_new(options)?);
        let executor = PreAggExecutor::new(device.clone(), config);
        Ok(NativeExecutor { device, executor })
    }

    pub fn device(&self) -> &ThreadedDevice {
        &self.device
    }

    pub fn config(&self) -> &PreAggConfig {
        self.executor.config()
    }

    pub fn execute(
        &self,
        kernels: Arc<dyn ReductionKernels>,
        plan: PlanEstimates,
        source: Box<dyn RowSource>,
    ) -> Result<PreAggStream> {
        self.executor.execute(kernels, plan, source)
    }
}
