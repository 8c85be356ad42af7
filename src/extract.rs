//! Structured-bill extraction from OCR page text
//!
//! Turns page-ordered OCR output into the categories → rows shape the
//! verifier consumes. Extraction is tolerant by design: a line that fails
//! to parse is skipped, a page with no text becomes a warning, and the
//! result is whatever could be read. Only the caller decides whether an
//! empty result is an error.

use crate::ocr::PageText;
use crate::types::{BillCategory, BillHeader, ExtractedBill, ItemRow, PatientInfo, PaymentRow};
use chrono::NaiveDate;
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

/// Trailing numbers of an item row: `name  [qty] [rate] amount`
static TRAILING_NUMBERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:(?:rs\.?|₹)\s*)?(\d[\d,]*(?:\.\d+)?)\s*$").unwrap()
});

/// `Label : value` header lines
static LABELED_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*([a-z][a-z ./]*?)\s*[:\-]\s*(.+?)\s*$").unwrap());

/// Section vocabulary recognized as category headers
const CATEGORY_HINTS: &[&str] = &[
    "pharmacy", "medicines", "consultation", "investigation", "investigations", "radiology",
    "laboratory", "lab charges", "room rent", "room charges", "surgery", "procedure", "procedures",
    "consumables", "nursing", "physiotherapy", "ot charges", "icu charges", "hospitalization",
    "hospital", "services", "miscellaneous",
];

/// Summary rows that end the item listing
const TOTAL_LABELS: &[&str] = &["grand total", "net amount", "net payable", "total amount", "bill amount"];

const PAYMENT_LABELS: &[&str] = &["paid", "payment", "receipt", "amount received"];

/// Extract a structured bill from OCR pages.
pub fn extract_bill(pages: &[PageText]) -> ExtractedBill {
    let mut bill = ExtractedBill::default();
    let mut current_category: Option<BillCategory> = None;

    for page in pages {
        if page.is_blank() {
            bill.extraction_warnings
                .push(format!("page {} produced no text", page.page));
            continue;
        }
        for raw_line in page.line_texts() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            parse_line(line, page.page, &mut bill, &mut current_category);
        }
    }
    if let Some(cat) = current_category.take() {
        if !cat.items.is_empty() {
            bill.categories.push(cat);
        }
    }

    debug!(
        categories = bill.categories.len(),
        items = bill.item_count(),
        warnings = bill.extraction_warnings.len(),
        "bill extracted"
    );
    bill
}

fn parse_line(
    line: &str,
    page: u32,
    bill: &mut ExtractedBill,
    current_category: &mut Option<BillCategory>,
) {
    // Labeled header fields win over everything else.
    if let Some(caps) = LABELED_FIELD.captures(line) {
        let label = caps[1].trim().to_lowercase();
        let value = caps[2].trim().to_string();
        if apply_header_field(&label, &value, bill) {
            return;
        }
    }

    let lower = line.to_lowercase();

    // Summary section: totals and payments.
    if let Some(amount) = trailing_amount(line) {
        if TOTAL_LABELS.iter().any(|l| lower.starts_with(l)) {
            bill.grand_total = Some(amount);
            return;
        }
        if PAYMENT_LABELS.iter().any(|l| lower.starts_with(l)) {
            let mode = strip_trailing_numbers(line);
            bill.payments.push(PaymentRow {
                mode: (!mode.is_empty()).then_some(mode),
                amount,
            });
            return;
        }
    }

    if is_category_header(line) {
        if let Some(prev) = current_category.take() {
            if !prev.items.is_empty() {
                bill.categories.push(prev);
            }
        }
        *current_category = Some(BillCategory {
            category_name: line.trim_end_matches(':').trim().to_string(),
            items: Vec::new(),
        });
        return;
    }

    if let Some(row) = parse_item_row(line, page) {
        let category = current_category.get_or_insert_with(|| BillCategory {
            category_name: "General".to_string(),
            items: Vec::new(),
        });
        let mut row = row;
        row.category = Some(category.category_name.clone());
        category.items.push(row);
    }
}

/// `true` when the field was consumed as a patient/header value
fn apply_header_field(label: &str, value: &str, bill: &mut ExtractedBill) -> bool {
    match label {
        "patient name" | "name" => {
            bill.patient.name.get_or_insert_with(|| value.to_string());
            true
        }
        "uhid" | "mr no" | "mrn" | "patient id" | "reg no" => {
            bill.patient
                .patient_id
                .get_or_insert_with(|| value.to_string());
            true
        }
        "age" | "age/sex" | "age / sex" => {
            bill.patient.age.get_or_insert_with(|| value.to_string());
            true
        }
        "bill no" | "bill number" | "invoice no" | "invoice number" => {
            bill.header
                .bill_number
                .get_or_insert_with(|| value.to_string());
            true
        }
        "bill date" | "invoice date" | "date" => {
            if bill.header.invoice_date.is_none() {
                bill.header.invoice_date = parse_date(value);
            }
            bill.header.invoice_date.is_some()
        }
        "admission date" | "date of admission" | "doa" => {
            bill.header.admission_date = parse_date(value);
            bill.header.admission_date.is_some()
        }
        "discharge date" | "date of discharge" | "dod" => {
            bill.header.discharge_date = parse_date(value);
            bill.header.discharge_date.is_some()
        }
        _ => false,
    }
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    const FORMATS: &[&str] = &["%d/%m/%Y", "%d-%m-%Y", "%Y-%m-%d", "%d/%m/%y", "%d %b %Y"];
    let value = value.trim();
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

fn is_category_header(line: &str) -> bool {
    if trailing_amount(line).is_some() {
        return false;
    }
    let lower = line.trim_end_matches(':').trim().to_lowercase();
    if lower.is_empty() || lower.split_whitespace().count() > 5 {
        return false;
    }
    line.trim_end().ends_with(':') || CATEGORY_HINTS.iter().any(|h| lower == *h)
}

/// Parse `name [qty] [rate] amount` with the amount as the last number.
fn parse_item_row(line: &str, page: u32) -> Option<ItemRow> {
    let mut numbers: Vec<f64> = Vec::new();
    let mut rest = line.to_string();
    // Peel up to three trailing numbers: amount, then rate, then quantity.
    while numbers.len() < 3 {
        let peeled = peel_trailing_number(&rest);
        let Some((start, value)) = peeled else {
            break;
        };
        numbers.push(value);
        rest.truncate(start);
        rest = rest.trim_end().to_string();
    }

    let name = rest.trim();
    if name.is_empty() || numbers.is_empty() {
        return None;
    }

    // numbers is amount-first because peeling ran right to left.
    let (amount, rate, quantity) = match numbers.len() {
        1 => (numbers[0], None, None),
        2 => (numbers[0], Some(numbers[1]), None),
        _ => (numbers[0], Some(numbers[1]), Some(numbers[2])),
    };
    if amount < 0.0 {
        return None;
    }
    Some(ItemRow {
        item_name: name.to_string(),
        amount,
        quantity,
        rate,
        page: Some(page),
        category: None,
    })
}

/// Match offset and parsed value of the last number on the line
fn peel_trailing_number(line: &str) -> Option<(usize, f64)> {
    let caps = TRAILING_NUMBERS.captures(line)?;
    let start = caps.get(0)?.start();
    let value: f64 = caps[1].replace(',', "").parse().ok()?;
    Some((start, value))
}

fn trailing_amount(line: &str) -> Option<f64> {
    peel_trailing_number(line).map(|(_, value)| value)
}

fn strip_trailing_numbers(line: &str) -> String {
    let mut rest = line.to_string();
    while let Some((start, _)) = peel_trailing_number(&rest) {
        rest.truncate(start);
        rest = rest.trim_end().to_string();
    }
    rest.trim().trim_end_matches([':', '-']).trim().to_string()
}
