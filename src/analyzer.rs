use log::{debug, info, warn};
use rayon::prelude::*;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

use crate::decrypt::ViewStateDecryptor;
use crate::extractor::Extractor;
use crate::gadgets::GadgetCatalog;
use crate::models::{ForensicRecord, RunSummary, ViewStateEvent};
use crate::output::ReportWriter;

#[derive(Debug, Error)]
pub enum TriageError {
    #[error("no ViewStates were found or decrypted from the provided input")]
    EmptyResultSet,
    #[error("failed to write report: {0}")]
    Report(#[from] std::io::Error),
}

/// Runs the extractor and the gadget matcher over each event's payload.
pub struct TriageAnalyzer<'a> {
    decryptor: &'a dyn ViewStateDecryptor,
    extractor: Extractor,
    catalog: &'a GadgetCatalog,
}

impl<'a> TriageAnalyzer<'a> {
    pub fn new(
        decryptor: &'a dyn ViewStateDecryptor,
        extractor: Extractor,
        catalog: &'a GadgetCatalog,
    ) -> Self {
        TriageAnalyzer {
            decryptor,
            extractor,
            catalog,
        }
    }

    /// Analyses one decrypted blob. Also used directly for raw payload files.
    pub fn inspect(&self, event: ViewStateEvent, blob: Vec<u8>) -> ForensicRecord {
        let extraction = self.extractor.extract(&blob);
        let gadgets = self.catalog.scan(&blob);
        ForensicRecord {
            event,
            decrypted: Some(blob),
            decryption_error: None,
            extraction: Some(extraction),
            gadgets: Some(gadgets),
        }
    }

    pub fn triage_one(&self, event: &ViewStateEvent) -> ForensicRecord {
        match self.decryptor.decrypt(&event.viewstate) {
            Ok(blob) => {
                debug!("Decrypted ViewState into {} bytes", blob.len());
                self.inspect(event.clone(), blob)
            }
            Err(e) => {
                warn!(
                    "Failed to decrypt ViewState from {}: {}",
                    event.source_ip.as_deref().unwrap_or("ad-hoc payload"),
                    e
                );
                ForensicRecord {
                    event: event.clone(),
                    decrypted: None,
                    decryption_error: Some(e.to_string()),
                    extraction: None,
                    gadgets: None,
                }
            }
        }
    }

    /// Triage every event on the rayon pool. Output order matches input order.
    pub fn triage<F>(
        &self,
        events: &[ViewStateEvent],
        progress_callback: F,
    ) -> Result<Vec<ForensicRecord>, TriageError>
    where
        F: Fn(f32) + Sync,
    {
        if events.is_empty() {
            return Err(TriageError::EmptyResultSet);
        }

        info!("Triaging {} ViewStates against {} gadget rules", events.len(), self.catalog.len());
        let total = events.len();
        let processed = AtomicUsize::new(0);

        let records: Vec<ForensicRecord> = events
            .par_iter()
            .map(|event| {
                let record = self.triage_one(event);
                let count = processed.fetch_add(1, Ordering::SeqCst);
                progress_callback((count + 1) as f32 / total as f32 * 100.0);
                record
            })
            .collect();

        info!("Triage completed for {} records", records.len());
        Ok(records)
    }
}

/// Triage `events` and write the report. Nothing is written when there is
/// nothing to report.
pub fn triage_to_report<F>(
    analyzer: &TriageAnalyzer<'_>,
    events: &[ViewStateEvent],
    writer: &ReportWriter,
    path: &Path,
    progress_callback: F,
) -> Result<RunSummary, TriageError>
where
    F: Fn(f32) + Sync,
{
    let records = analyzer.triage(events, progress_callback)?;
    writer.write(&records, path)?;
    Ok(RunSummary::from_records(&records))
}
