use anyhow::{Context, Result};
use prism_transport::{MultiSearch, MultiSearchConfig, RequestOptions, Transport};
use serde_json::Value;
use std::path::Path;

/// Run header/body line pairs from an NDJSON file through the batcher
pub async fn run_msearch(transport: &Transport, file: &Path, config: MultiSearchConfig) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let lines = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str::<Value>(line)
                .with_context(|| format!("Line {} is not valid JSON", i + 1))
        })
        .collect::<Result<Vec<_>>>()?;

    if lines.len() % 2 != 0 {
        anyhow::bail!("Expected header/body line pairs, got {} lines", lines.len());
    }

    let msearch = MultiSearch::new(transport.clone(), config, RequestOptions::default())?;
    let handles: Vec<_> = lines
        .chunks(2)
        .map(|pair| msearch.search(pair[0].clone(), pair[1].clone()))
        .collect();
    msearch.stop(None);

    let mut failures = 0;
    for (i, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(result) => {
                println!(
                    "#{} {} document(s): {}",
                    i,
                    result.documents.len(),
                    serde_json::to_string(&result.documents)?
                );
            }
            Err(e) => {
                failures += 1;
                println!("#{} error: {}", i, e);
            }
        }
    }
    msearch.finished().await?;

    if failures > 0 {
        anyhow::bail!("{} search(es) failed", failures);
    }
    Ok(())
}
