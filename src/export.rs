use std::path::Path;
use tracing::info;

use crate::assembler::CardRecord;
use crate::error::Result;

const HEADER: &str = "word\tsentence\tdefinition\tscreenshot\taudio\tstart";

fn cell(value: &str) -> String {
    value.replace(['\t', '\r', '\n'], " ")
}

/// Render cards as tab-separated rows with a header line
pub fn to_tsv(cards: &[CardRecord]) -> String {
    let mut out = String::from(HEADER);
    out.push('\n');
    for card in cards {
        let row = [
            cell(&card.word),
            cell(&card.sentence),
            cell(&card.definition),
            cell(&card.screenshot_path.to_string_lossy()),
            cell(&card.audio_path.to_string_lossy()),
            format!("{:.2}", card.timestamp_secs),
        ];
        out.push_str(&row.join("\t"));
        out.push('\n');
    }
    out
}

pub async fn write_tsv(cards: &[CardRecord], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, to_tsv(cards)).await?;
    info!("📝 Exported {} cards to {}", cards.len(), path.display());
    Ok(())
}
