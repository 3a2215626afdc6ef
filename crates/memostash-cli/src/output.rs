use std::io;
use std::path::Path;

use anyhow::Result;
use prettytable::format::consts::FORMAT_CLEAN;
use prettytable::{Row, Table, cell, row};
use serde::Serialize;

use memostash::ArgumentSnapshot;
use memostash::caching::StoredEntry;

/// The serialized form of one entry.
#[derive(Debug, Serialize)]
struct EntryInfo<'a> {
    producer: &'a str,
    version: &'a str,
    arguments: &'a ArgumentSnapshot,
    created_at: String,
    payload_len: u64,
    path: &'a Path,
}

impl<'a> From<&'a StoredEntry> for EntryInfo<'a> {
    fn from(entry: &'a StoredEntry) -> Self {
        let header = &entry.header;
        Self {
            producer: header.producer.name(),
            version: header.producer.version(),
            arguments: &header.arguments,
            created_at: humantime::format_rfc3339_seconds(header.created_at).to_string(),
            payload_len: entry.payload_len,
            path: &entry.path,
        }
    }
}

pub fn print_json(entries: &[StoredEntry]) -> Result<()> {
    let infos: Vec<EntryInfo> = entries.iter().map(EntryInfo::from).collect();
    serde_json::to_writer_pretty(io::stdout().lock(), &infos)?;
    println!();
    Ok(())
}

pub fn print_table(entries: &[StoredEntry]) {
    if entries.is_empty() {
        println!("No entries.");
        return;
    }

    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "Producer", "Version", "Created", "Size", "Arguments", "Path"]);

    for entry in entries {
        let info = EntryInfo::from(entry);
        let mut row = Row::empty();
        row.add_cell(cell!(info.producer));
        row.add_cell(cell!(info.version));
        row.add_cell(cell!(info.created_at));
        row.add_cell(cell!(r->info.payload_len));
        row.add_cell(cell!(info.arguments.render_compact()));
        row.add_cell(cell!(info.path.display()));
        table.add_row(row);
    }

    table.printstd();
}
