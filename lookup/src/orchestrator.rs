//! Concurrent batch calibration over many targets.
//!
//! Each calibration target - an (element, edge, harmonic) triple - gets
//! one full scan pass. Passes are logically independent work units: they
//! are all issued together and joined behind a single barrier, and one
//! pass failing is reported against its target without blocking or
//! corrupting the siblings. Successful records are committed to the store
//! as one batch after every pass has finished, so no pass ever observes a
//! partial batch.
//!
//! Targets sharing a physical axis pair rely on the `Motor`/`Detector`
//! implementations to serialize the actual motion; two concurrent passes
//! against the *same* identity are a caller error and not defended
//! against.

use crate::record::{is_known_harmonic, Record};
use crate::scan::ScanError;
use crate::store::{KvStore, RecordStore, StoreError};
use futures::future::join_all;
use std::future::Future;
use thiserror::Error;
use tracing::{info, warn};

/// Error building a calibration target.
#[derive(Debug, Error)]
pub enum TargetError {
    /// Harmonic outside the installation's known set
    #[error("unsupported harmonic {0}")]
    UnknownHarmonic(u32),
}

/// Identity of one calibration: element, absorption edge, harmonic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CalibrationTarget {
    element: String,
    edge: String,
    harmonic: u32,
}

impl CalibrationTarget {
    /// Create a target, rejecting harmonics outside
    /// [`crate::record::KNOWN_HARMONICS`].
    pub fn new(
        element: impl Into<String>,
        edge: impl Into<String>,
        harmonic: u32,
    ) -> Result<Self, TargetError> {
        if !is_known_harmonic(harmonic) {
            return Err(TargetError::UnknownHarmonic(harmonic));
        }
        Ok(Self {
            element: element.into(),
            edge: edge.into(),
            harmonic,
        })
    }

    pub fn element(&self) -> &str {
        &self.element
    }

    pub fn edge(&self) -> &str {
        &self.edge
    }

    pub fn harmonic(&self) -> u32 {
        self.harmonic
    }

    /// Store key under which this target's record lives.
    ///
    /// Distinct identities map to distinct keys, so concurrent passes
    /// over different targets never collide in the store.
    pub fn store_key(&self) -> String {
        format!("{}/{}/H{}", self.element, self.edge, self.harmonic)
    }
}

/// What a calibration batch produced.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Targets whose records were persisted, with the records
    pub saved: Vec<(CalibrationTarget, Record)>,
    /// Targets whose pass failed, with the per-target error
    pub failed: Vec<(CalibrationTarget, ScanError)>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Run one calibration pass per target and commit the results in batch.
///
/// `run_pass` maps a target onto its pass future; all passes run
/// concurrently and this function suspends until the last one finishes.
/// Per-target failures are collected into the outcome (and logged), never
/// propagated as the batch's own error - only a store failure during the
/// final commit aborts the batch itself.
pub async fn calibrate_all<S, F, Fut>(
    targets: Vec<CalibrationTarget>,
    run_pass: F,
    store: &RecordStore<S>,
) -> Result<BatchOutcome, StoreError>
where
    S: KvStore,
    F: Fn(CalibrationTarget) -> Fut,
    Fut: Future<Output = Result<Record, ScanError>>,
{
    info!(targets = targets.len(), "starting calibration batch");

    let passes = targets.into_iter().map(|target| {
        let pass = run_pass(target.clone());
        async move { (target, pass.await) }
    });
    let results = join_all(passes).await;

    let mut saved = Vec::new();
    let mut failed = Vec::new();
    for (target, result) in results {
        match result {
            Ok(record) => saved.push((target, record)),
            Err(error) => {
                warn!(key = %target.store_key(), %error, "calibration pass failed");
                failed.push((target, error));
            }
        }
    }

    let entries: Vec<(String, Record)> = saved
        .iter()
        .map(|(target, record)| (target.store_key(), record.clone()))
        .collect();
    store.save_batch(&entries).await?;

    info!(
        saved = saved.len(),
        failed = failed.len(),
        "calibration batch committed"
    );
    Ok(BatchOutcome { saved, failed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{LookupScan, ScanConfig};
    use crate::store::MemoryKvStore;
    use beamline::sim::{FailingMotor, GaussianDiode, SimMotor};

    fn sim_scan(
        initial_gap: f64,
    ) -> LookupScan<SimMotor, SimMotor, GaussianDiode<impl Fn(f64) -> f64 + Send + Sync>> {
        let bragg = SimMotor::new("bragg", 0.0);
        let gap = SimMotor::new("gap", initial_gap);
        let diode = GaussianDiode::new(gap.clone(), bragg.clone(), |b| 10.0 + 2.0 * b, 1.0, 2.0);
        LookupScan::new(bragg, gap, diode, sim_config(initial_gap))
    }

    fn sim_config(initial_gap: f64) -> ScanConfig {
        ScanConfig {
            bragg_start: 0.0,
            bragg_step: 1.0,
            bragg_steps: 3,
            initial_gap,
            gap_range: 10.0,
            gap_step: 1.0,
            recenter: true,
            gap_offset: 0.0,
            peak_bounds: None,
            detector_name: "sim diode".to_string(),
        }
    }

    #[tokio::test]
    async fn batch_persists_every_successful_target() {
        let store = RecordStore::new(MemoryKvStore::new());
        let targets = vec![
            CalibrationTarget::new("Fe", "K", 7).unwrap(),
            CalibrationTarget::new("Mo", "L3", 19).unwrap(),
        ];

        let fe = sim_scan(10.0);
        let mo = sim_scan(10.0);
        let run = |target: CalibrationTarget| {
            let (fe, mo) = (&fe, &mo);
            async move {
                let scan = if target.element() == "Fe" { fe } else { mo };
                scan.run_to_record(target.element(), target.edge(), target.harmonic())
                    .await
            }
        };

        let outcome = calibrate_all(targets, run, &store).await.unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.saved.len(), 2);

        let fe_record = store.get("Fe/K/H7", 7, "Fe", "K").await.unwrap();
        assert_eq!(fe_record.measurements.len(), 3);
        assert!(store.get("Mo/L3/H19", 19, "Mo", "L3").await.is_ok());
    }

    #[tokio::test]
    async fn one_failing_pass_does_not_block_its_siblings() {
        let store = RecordStore::new(MemoryKvStore::new());
        let targets = vec![
            CalibrationTarget::new("Fe", "K", 7).unwrap(),
            CalibrationTarget::new("Mo", "L3", 19).unwrap(),
        ];

        // The Fe pass dies mid-sub-scan; Mo runs normally.
        let fe_bragg = SimMotor::new("bragg", 0.0);
        let fe_gap_inner = SimMotor::new("gap", 10.0);
        let fe_diode = GaussianDiode::new(
            fe_gap_inner.clone(),
            fe_bragg.clone(),
            |b| 10.0 + 2.0 * b,
            1.0,
            2.0,
        );
        let fe = LookupScan::new(
            fe_bragg,
            FailingMotor::new(fe_gap_inner, 4),
            fe_diode,
            sim_config(10.0),
        );
        let mo = sim_scan(10.0);

        let run = |target: CalibrationTarget| {
            let (fe, mo) = (&fe, &mo);
            async move {
                if target.element() == "Fe" {
                    fe.run_to_record(target.element(), target.edge(), target.harmonic())
                        .await
                } else {
                    mo.run_to_record(target.element(), target.edge(), target.harmonic())
                        .await
                }
            }
        };

        let outcome = calibrate_all(targets, run, &store).await.unwrap();
        assert!(!outcome.is_complete());
        assert_eq!(outcome.saved.len(), 1);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0.element(), "Fe");
        assert!(matches!(outcome.failed[0].1, ScanError::Axis(_)));

        // The failed pass persisted nothing; the sibling's record landed.
        assert!(matches!(
            store.get("Fe/K/H7", 7, "Fe", "K").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(store.get("Mo/L3/H19", 19, "Mo", "L3").await.is_ok());
    }

    #[test]
    fn target_rejects_unknown_harmonic() {
        assert!(matches!(
            CalibrationTarget::new("Fe", "K", 2),
            Err(TargetError::UnknownHarmonic(2))
        ));
    }

    #[test]
    fn store_key_encodes_the_identity_triple() {
        let target = CalibrationTarget::new("Fe", "K", 7).unwrap();
        assert_eq!(target.store_key(), "Fe/K/H7");
    }
}
