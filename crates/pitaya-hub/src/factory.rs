//! Backend construction.

use async_trait::async_trait;
use pitaya_core::{Backend, BackendFactory, BackendSpec, PitayaResult};
use pitaya_driver_scpi::ScpiBackend;
use pitaya_driver_sim::{PlantBank, SimBackend};

/// Opens the simulator for `mock` specs and the SCPI driver otherwise.
///
/// Simulated plants are kept in one [`PlantBank`], so every backend this
/// factory opens for the same simulated address steps the same plant.
#[derive(Debug, Clone, Default)]
pub struct StandardBackendFactory {
    plants: PlantBank,
}

impl StandardBackendFactory {
    /// Factory with an empty plant bank.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory sharing an existing plant bank.
    pub fn with_plants(plants: PlantBank) -> Self {
        Self { plants }
    }

    /// Plants of the simulated devices opened so far.
    pub fn plants(&self) -> &PlantBank {
        &self.plants
    }
}

#[async_trait]
impl BackendFactory for StandardBackendFactory {
    async fn create(&self, spec: &BackendSpec) -> PitayaResult<Box<dyn Backend>> {
        if spec.mock {
            Ok(Box::new(SimBackend::open(spec, &self.plants)?))
        } else {
            Ok(Box::new(ScpiBackend::open(spec).await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pitaya_core::BackendKind;
    use pitaya_driver_scpi::loopback::LoopbackDevice;

    #[tokio::test]
    async fn test_mock_flag_selects_backend() {
        let factory = StandardBackendFactory::new();
        let sim = factory
            .create(&BackendSpec::new("sim-dev", "cfg", true))
            .await
            .unwrap();
        assert_eq!(sim.kind(), BackendKind::Simulated);
        assert!(factory.plants().get("sim-dev").is_some());

        let device = LoopbackDevice::spawn().await.unwrap();
        let real = factory
            .create(&BackendSpec::new(device.address(), "cfg", false))
            .await
            .unwrap();
        assert_eq!(real.kind(), BackendKind::Scpi);
    }
}
