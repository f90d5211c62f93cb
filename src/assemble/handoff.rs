use crate::cubemap::model::StereoCubemap;
use crate::foundation::core::{EyeCount, PixelFormat};
use crate::observe::observer::PipelineObserver;
use std::sync::Arc;

/// Describes the stream a delivered cubemap came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceInfo {
    pub name: String,
    pub eyes: EyeCount,
    pub face_width: u32,
    pub face_height: u32,
    pub format: PixelFormat,
}

/// What a consumer does with a delivered cubemap.
#[derive(Debug)]
pub enum Handoff {
    /// Kept the new cubemap and gives back an older one for reuse.
    Recycle(StereoCubemap),
    /// Kept the new cubemap; nothing to give back yet.
    Retained,
    /// Did not take the new cubemap (busy); it goes back to the pool.
    Declined(StereoCubemap),
    /// Shutting down. No further cubemaps will be delivered.
    Closed,
}

/// Receives completed cubemaps, one at a time.
pub trait CubemapConsumer: Send {
    fn on_next_cubemap(&mut self, source: &SourceInfo, cubemap: StereoCubemap) -> Handoff;
}

impl<F> CubemapConsumer for F
where
    F: FnMut(&SourceInfo, StereoCubemap) -> Handoff + Send,
{
    fn on_next_cubemap(&mut self, source: &SourceInfo, cubemap: StereoCubemap) -> Handoff {
        self(source, cubemap)
    }
}

/// Result of one delivery, for the engine's pool and state.
#[derive(Debug)]
pub(crate) enum DeliveryOutcome {
    Delivered {
        recycle: Option<StereoCubemap>,
        declined: bool,
    },
    Closed,
}

/// Hands completed cubemaps to the registered consumer.
///
/// Without a consumer (headless) a delivery only reaches the observer and the cubemap is dropped.
pub struct DeliveryHandoff {
    source: SourceInfo,
    consumer: Option<Box<dyn CubemapConsumer>>,
    observer: Arc<dyn PipelineObserver>,
    closed: bool,
}

impl DeliveryHandoff {
    pub fn new(
        source: SourceInfo,
        consumer: Option<Box<dyn CubemapConsumer>>,
        observer: Arc<dyn PipelineObserver>,
    ) -> Self {
        Self {
            source,
            consumer,
            observer,
            closed: false,
        }
    }

    pub fn source(&self) -> &SourceInfo {
        &self.source
    }

    pub fn is_headless(&self) -> bool {
        self.consumer.is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Transfer `cubemap` to the consumer.
    pub(crate) fn deliver(
        &mut self,
        key: u64,
        cubemap: StereoCubemap,
        faces: usize,
    ) -> DeliveryOutcome {
        if self.closed {
            return DeliveryOutcome::Closed;
        }
        self.observer.cubemap_delivered(key, faces);
        let Some(consumer) = self.consumer.as_mut() else {
            drop(cubemap);
            return DeliveryOutcome::Delivered {
                recycle: None,
                declined: false,
            };
        };
        match consumer.on_next_cubemap(&self.source, cubemap) {
            Handoff::Recycle(old) => DeliveryOutcome::Delivered {
                recycle: Some(old),
                declined: false,
            },
            Handoff::Retained => DeliveryOutcome::Delivered {
                recycle: None,
                declined: false,
            },
            Handoff::Declined(same) => DeliveryOutcome::Delivered {
                recycle: Some(same),
                declined: true,
            },
            Handoff::Closed => {
                tracing::info!(key, "consumer closed, draining");
                self.closed = true;
                DeliveryOutcome::Closed
            }
        }
    }
}
