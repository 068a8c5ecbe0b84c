//! Report emission: machine-readable CSV and JSON records of a stress run.
//!
//! The CSV carries one row per cell so the full matrix can be inspected in
//! anything that reads tables; the JSON is the complete `CombinedVerdict`
//! record, suitable for archiving next to the locked protocol and manifest.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;
use crate::verdict::CombinedVerdict;

const CSV_HEADER: &str = "cell,dataset,channel,null_model,seed,observed,\
null_mean,null_std,null_count,p_value,z_score,tier,verdict,reduced_rigor,error";

/// Quote a CSV field if it contains a delimiter or quote.
fn csv_field(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Write one row per cell. Errored cells keep their row, with the error
/// message in the last column and the statistic columns empty.
pub fn write_csv(path: &Path, combined: &CombinedVerdict) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "{CSV_HEADER}")?;
    for cell in &combined.cells {
        match &cell.result {
            Ok(r) => writeln!(
                w,
                "{},{},{},{},{},{},{},{},{},{},{},{},{},{},",
                csv_field(&cell.cell.name),
                csv_field(&cell.cell.dataset),
                csv_field(&cell.cell.channel),
                csv_field(&r.null_model),
                r.seed,
                r.observed,
                r.null.mean,
                r.null.std,
                r.null.count,
                r.p_value,
                r.z_score,
                r.tier.label(),
                r.verdict.label(),
                r.reduced_rigor,
            )?,
            Err(e) => writeln!(
                w,
                "{},{},{},,,,,,,,,,,,{}",
                csv_field(&cell.cell.name),
                csv_field(&cell.cell.dataset),
                csv_field(&cell.cell.channel),
                csv_field(e),
            )?,
        }
    }
    w.flush()?;
    Ok(())
}

/// Write the full combined record as pretty-printed JSON.
pub fn write_json(path: &Path, combined: &CombinedVerdict) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut w, combined)?;
    writeln!(w)?;
    w.flush()?;
    Ok(())
}

/// One-screen human summary for the console.
pub fn render_summary(combined: &CombinedVerdict) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "protocol {} -> {}\n",
        combined.protocol_id,
        combined.verdict.label()
    ));
    out.push_str(&format!(
        "cells: {} pass, {} fail, {} inconclusive, {} errored (rule: {} passing at p < {})\n",
        combined.passing,
        combined.failing,
        combined.inconclusive,
        combined.errored,
        combined.rule.min_passing,
        combined.rule.p_threshold
    ));
    if let Some(p) = combined.min_p_value {
        out.push_str(&format!("smallest p-value: {p:.5}\n"));
    }
    for cell in &combined.cells {
        match &cell.result {
            Ok(r) => out.push_str(&format!(
                "  {:<50} p={:.5} z={:+.2} {}{}\n",
                cell.cell.name,
                r.p_value,
                r.z_score,
                r.verdict.label(),
                if r.reduced_rigor { " [reduced rigor]" } else { "" }
            )),
            Err(e) => out.push_str(&format!("  {:<50} ERROR: {e}\n", cell.cell.name)),
        }
    }
    out
}
