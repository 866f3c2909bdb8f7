use rust_xlsxwriter::{Color, Format, FormatAlign, Workbook, Worksheet, XlsxError};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::types::{AdditionalField, ExportRecord, ServiceEntry};

pub const RESULTS_SHEET: &str = "results";
pub const URLS_SHEET: &str = "urls";

/// Fixed spreadsheet columns, before any additional fields.
pub const BASE_HEADERS: [&str; 7] = ["HOST", "Title", "Domain", "IP", "Port", "Protocol", "Server"];

const COLUMN_WIDTHS: [(u16, f64); 4] = [(0, 30.0), (1, 38.0), (2, 20.0), (3, 15.0)];

/// Result of an export, ready to show to the user.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ExportOutcome {
    pub success: bool,
    pub message: String,
    pub path: PathBuf,
}

impl ExportOutcome {
    fn written(path: &Path, failed_page: Option<u32>) -> Self {
        let message = match failed_page {
            Some(page) => format!(
                "partial export: page {page} failed to load, file saved to {}",
                path.display()
            ),
            None => format!("export finished, file saved to {}", path.display()),
        };
        info!(path = %path.display(), ?failed_page, "export written");
        Self {
            success: true,
            message,
            path: path.to_path_buf(),
        }
    }

    fn failed(path: &Path, err: impl std::fmt::Display) -> Self {
        warn!(path = %path.display(), error = %err, "export failed");
        Self {
            success: false,
            message: format!("export failed: {err}"),
            path: path.to_path_buf(),
        }
    }
}

/// Spreadsheet header row for the given additional fields.
pub fn headers(fields: &[AdditionalField]) -> Vec<&'static str> {
    BASE_HEADERS
        .iter()
        .copied()
        .chain(fields.iter().map(|f| f.header()))
        .collect()
}

/// One normalized URL per record, in record order.
pub fn normalized_urls<T: ServiceEntry>(records: &[T]) -> Vec<String> {
    records.iter().map(|r| r.service().normalized_url()).collect()
}

/// `fofa_export_<unix seconds>.<ext>`
pub fn default_file_name(ext: &str) -> String {
    format!("fofa_export_{}.{ext}", OffsetDateTime::now_utc().unix_timestamp())
}

/// Write a two-sheet workbook: records on the first sheet, URLs on the second.
///
/// `failed_page` marks a partial export; the file is still written and the
/// message names the page that could not be loaded.
pub fn export_xlsx(
    path: &Path,
    records: &[ExportRecord],
    urls: &[String],
    fields: &[AdditionalField],
    failed_page: Option<u32>,
) -> ExportOutcome {
    match write_workbook(path, records, urls, fields) {
        Ok(()) => ExportOutcome::written(path, failed_page),
        Err(e) => ExportOutcome::failed(path, e),
    }
}

/// Write one URL per line, no header.
pub fn export_txt(path: &Path, urls: &[String], failed_page: Option<u32>) -> ExportOutcome {
    let res = File::create(path).and_then(|f| {
        let mut w = BufWriter::new(f);
        for url in urls {
            writeln!(w, "{url}")?;
        }
        w.flush()
    });
    match res {
        Ok(()) => ExportOutcome::written(path, failed_page),
        Err(e) => ExportOutcome::failed(path, e),
    }
}

fn write_workbook(
    path: &Path,
    records: &[ExportRecord],
    urls: &[String],
    fields: &[AdditionalField],
) -> Result<(), XlsxError> {
    let header_fmt = Format::new()
        .set_bold()
        .set_font_size(14)
        .set_font_color(Color::White)
        .set_background_color(Color::RGB(0x366092))
        .set_align(FormatAlign::Center)
        .set_align(FormatAlign::VerticalCenter);

    let mut sheet = Worksheet::new();
    sheet.set_name(RESULTS_SHEET)?;
    for (col, title) in headers(fields).into_iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, title, &header_fmt)?;
    }

    for (i, rec) in records.iter().enumerate() {
        let row = i as u32 + 1;
        let s = &rec.service;
        let text = [
            (0, s.host.as_str()),
            (1, s.title.as_str()),
            (2, s.domain.as_str()),
            (3, s.ip.as_str()),
            (5, s.protocol.as_str()),
            (6, s.server.as_str()),
        ];
        for (col, value) in text {
            write_text(&mut sheet, row, col, value)?;
        }
        sheet.write_number(row, 4, s.port)?;
        for (j, field) in fields.iter().enumerate() {
            write_text(&mut sheet, row, (BASE_HEADERS.len() + j) as u16, s.extras.get(*field))?;
        }
    }
    for (col, width) in COLUMN_WIDTHS {
        sheet.set_column_width(col, width)?;
    }

    let mut url_sheet = Worksheet::new();
    url_sheet.set_name(URLS_SHEET)?;
    for (i, url) in urls.iter().enumerate() {
        url_sheet.write_string(i as u32, 0, url)?;
    }
    url_sheet.set_column_width(0, 40)?;

    let mut workbook = Workbook::new();
    workbook.push_worksheet(sheet);
    workbook.push_worksheet(url_sheet);
    workbook.save(path)
}

// Empty strings are left as blank cells.
fn write_text(sheet: &mut Worksheet, row: u32, col: u16, value: &str) -> Result<(), XlsxError> {
    if !value.is_empty() {
        sheet.write_string(row, col, value)?;
    }
    Ok(())
}
