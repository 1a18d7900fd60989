//! Tabular exports (CSV and XLSX) for conversation and admin downloads.

use axum::{
    http::header,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use rust_xlsxwriter::{Format, Workbook, XlsxError};

use crate::types::Message;

pub const SHEET_NAME: &str = "Datos";
const CELL_LIMIT: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("xlsx: {0}")]
    Xlsx(#[from] XlsxError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ExportError> for crate::error::ApiError {
    fn from(err: ExportError) -> Self {
        crate::error::ApiError::internal(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
    Xlsx,
}

impl ExportFormat {
    pub fn parse(raw: Option<&str>, default: Self) -> Option<Self> {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            None => Some(default),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "csv" => Some(Self::Csv),
                "json" => Some(Self::Json),
                "xlsx" => Some(Self::Xlsx),
                _ => None,
            },
        }
    }
}

pub struct Table {
    pub headers: Vec<&'static str>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<&'static str>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }
}

pub fn to_csv(table: &Table) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&table.headers)?;
    for row in &table.rows {
        writer.write_record(row)?;
    }
    writer.into_inner().map_err(|err| ExportError::Io(err.into_error()))
}

pub fn to_xlsx(table: &Table) -> Result<Vec<u8>, ExportError> {
    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(SHEET_NAME)?;
    for (col, header) in table.headers.iter().enumerate() {
        worksheet.write_string_with_format(0, col as u16, *header, &bold)?;
    }
    for (row_idx, row) in table.rows.iter().enumerate() {
        for (col, value) in row.iter().enumerate() {
            worksheet.write_string(row_idx as u32 + 1, col as u16, value)?;
        }
    }
    Ok(workbook.save_to_buffer()?)
}

pub fn truncate_cell(value: &str) -> String {
    value.chars().take(CELL_LIMIT).collect()
}

/// `dd/MM/yyyy` and `HH:mm:ss` parts of a stored timestamp.
pub fn split_timestamp(raw: &str) -> (String, String) {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => {
            let ts = ts.with_timezone(&Utc);
            (ts.format("%d/%m/%Y").to_string(), ts.format("%H:%M:%S").to_string())
        }
        Err(_) => (raw.to_string(), String::new()),
    }
}

pub fn conversation_table(messages: &[Message]) -> Table {
    let mut table = Table::new(vec!["Fecha", "Hora", "De", "Para", "Tipo", "Contenido", "Estado"]);
    for msg in messages {
        let (date, time) = split_timestamp(&msg.created_at);
        table.push(vec![
            date,
            time,
            msg.from_number.clone(),
            msg.to_number.clone(),
            msg.message_type.clone(),
            msg.content.clone(),
            msg.status.clone(),
        ]);
    }
    table
}

pub fn filename(prefix: &str, stamp: &str, extension: &str) -> String {
    format!("{prefix}_{stamp}.{extension}")
}

pub fn attachment(content_type: &'static str, filename: &str, body: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response()
}

pub const CSV_CONTENT_TYPE: &str = "text/csv; charset=utf-8";
pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
