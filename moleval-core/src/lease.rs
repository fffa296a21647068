//! Scoped device residency for a loaded model.
//!
//! A `ModelLease` is the only owner of a loaded model. `release()` runs the
//! runtime's release protocol and consumes the lease; a lease dropped without
//! `release()` (early return, panic, cancelled future) abandons the model
//! instead, so device memory is never held past the lease's scope.

use crate::collaborators::{GenerativeModel, ModelLoader};
use crate::device::Device;
use crate::error::EvalError;
use std::path::Path;
use tracing::{debug, warn};

pub struct ModelLease {
    model: Option<Box<dyn GenerativeModel>>,
    device: Device,
}

impl ModelLease {
    /// Load `checkpoint` onto `device`.
    pub async fn acquire(
        loader: &dyn ModelLoader,
        checkpoint: &Path,
        device: Device,
    ) -> Result<Self, EvalError> {
        let model = loader.load(checkpoint, device).await?;
        debug!(checkpoint = %checkpoint.display(), %device, "Model resident");
        Ok(Self {
            model: Some(model),
            device,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn model_mut(&mut self) -> &mut dyn GenerativeModel {
        // Only `release` and `drop` take the model out, and both consume self.
        self.model
            .as_deref_mut()
            .expect("model present until the lease is consumed")
    }

    /// Release the model from its device.
    pub async fn release(mut self) -> Result<(), EvalError> {
        let Some(mut model) = self.model.take() else {
            return Ok(());
        };
        let result = model.release().await;
        if result.is_err() {
            model.abandon();
        }
        drop(model);
        debug!(device = %self.device, "Model released");
        result
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        if let Some(mut model) = self.model.take() {
            warn!(device = %self.device, "Model lease dropped without release, abandoning model");
            model.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Event, EventLog, MockModelLoader};

    #[tokio::test]
    async fn test_release_runs_protocol() {
        let log = EventLog::new();
        let loader = MockModelLoader::new(log.clone());
        let lease = ModelLease::acquire(&loader, Path::new("m1/checkpoint_1.pt"), Device::Cuda(0))
            .await
            .unwrap();
        lease.release().await.unwrap();

        assert_eq!(
            log.events(),
            vec![Event::Load, Event::Release]
        );
    }

    #[tokio::test]
    async fn test_drop_abandons_model() {
        let log = EventLog::new();
        let loader = MockModelLoader::new(log.clone());
        {
            let mut lease = ModelLease::acquire(&loader, Path::new("m1/checkpoint_1.pt"), Device::Cpu)
                .await
                .unwrap();
            lease.model_mut().sample(3).await.unwrap();
        }

        assert_eq!(
            log.events(),
            vec![Event::Load, Event::Sample(3), Event::Abandon]
        );
    }

    #[tokio::test]
    async fn test_failed_release_falls_back_to_abandon() {
        let log = EventLog::new();
        let loader = MockModelLoader::new(log.clone()).failing_release();
        let lease = ModelLease::acquire(&loader, Path::new("m/checkpoint_2.pt"), Device::Cpu)
            .await
            .unwrap();
        assert!(lease.release().await.is_err());
        assert_eq!(
            log.events(),
            vec![Event::Load, Event::Release, Event::Abandon]
        );
    }
}
