//! Event-to-sink detection pipeline.
//!
//! Standard detections are delivered as soon as an event is evaluated.
//! Aggregation candidates go through the micro-batcher to a single consumer
//! thread that owns the windowed store and runs the aggregation cycle.

use std::sync::Arc;

use crate::batcher::{MicroBatcher, SubmitError};
use crate::config::BatchSettings;
use crate::engine::Engine;
use crate::event::StructuredEvent;
use crate::result::DetectionMatch;
use crate::store::{AggregationCycle, Candidate, WindowStore};

/// Receives detections (the detection-ingestion collaborator).
pub trait MatchSink: Send + Sync {
    fn deliver(&self, detection: DetectionMatch);
}

impl<F> MatchSink for F
where
    F: Fn(DetectionMatch) + Send + Sync,
{
    fn deliver(&self, detection: DetectionMatch) {
        self(detection)
    }
}

pub struct DetectionPipeline {
    engine: Arc<Engine>,
    sink: Arc<dyn MatchSink>,
    batcher: MicroBatcher<Candidate>,
}

impl DetectionPipeline {
    /// Start the aggregation consumer; it takes ownership of `store`.
    pub fn spawn<S>(
        engine: Arc<Engine>,
        mut store: S,
        sink: Arc<dyn MatchSink>,
        settings: &BatchSettings,
    ) -> std::io::Result<Self>
    where
        S: WindowStore + Send + 'static,
    {
        let cycle_engine = Arc::clone(&engine);
        let cycle_sink = Arc::clone(&sink);
        let batcher = MicroBatcher::spawn(settings, "vigil-aggregation", move |batch: Vec<Candidate>| {
            let rules = cycle_engine.snapshot();
            for detection in AggregationCycle::new(&rules).run(&mut store, batch) {
                cycle_sink.deliver(detection);
            }
        })?;

        Ok(DetectionPipeline {
            engine,
            sink,
            batcher,
        })
    }

    /// Evaluate one event; returns how many standard detections it produced.
    pub fn process(&self, event: &StructuredEvent) -> usize {
        let evaluation = self.engine.evaluate(event);
        let produced = evaluation.detections.len();
        for detection in evaluation.detections {
            self.sink.deliver(detection);
        }
        for candidate in evaluation.candidates {
            if let Err(e) = self.batcher.submit(candidate) {
                tracing::warn!(error = %e, "dropping aggregation candidate");
                if e == SubmitError::Closed {
                    break;
                }
            }
        }
        produced
    }

    /// Flush pending candidates and stop the consumer.
    pub fn shutdown(self) {
        self.batcher.shutdown();
    }
}
