//! System prompts for each model-driven workflow step.
//!
//! Every prompt lives here so wording changes touch one file, and so unit
//! tests can inspect the prompts without a model. Each prompt ends with the
//! JSON Schema of the reply it expects; the workflow parses the reply with
//! the same Rust type the schema was generated from.

use crate::schema::{AreasOfInterest, ExtractedHeader, ExtractedLineItems, ExtractedSummary, OcrToken};
use schemars::JsonSchema;

/// Transcribe every word of the stitched invoice image.
pub const OCR_SYSTEM_PROMPT: &str = r#"You are a precise OCR engine for invoices. Transcribe EVERY word visible in the image.

For each word return its text and a tight bounding box on a normalized 0-1000 coordinate plane:
- (0, 0) is the top-left corner of the image, (1000, 1000) the bottom-right corner.
- x1, y1 are the top-left corner of the word; x2, y2 the bottom-right corner.
- x2 and y2 must include the full width and height of the word.

Rules:
- One entry per word; do not merge words into lines.
- Keep reading order: top to bottom, left to right.
- Copy numbers, currency symbols and punctuation exactly as printed.
- Return ONLY a JSON object of the form {"tokens": [...]}; no commentary, no markdown fences."#;

/// Find the header, line-items and summary areas from OCR tokens.
pub const AOI_SYSTEM_PROMPT: &str = r#"You are an expert document layout analyst specializing in invoice processing. Your task is to identify the precise bounding boxes (x1, y1, x2, y2) for the primary functional areas of the provided invoice based on OCR tokens.

Definitions:
1. **header_area**: Encapsulates identifying metadata: Vendor/Client names, addresses, Invoice Number, Date, and Due Date.
2. **line_items_area**: The core tabular region containing itemized descriptions, quantities, and prices. Must include column headers and all rows.
3. **summary_area**: The bottom section containing Subtotal, Taxes (VAT/GST), and the final Total Amount.

Guidelines:
- Bounding boxes must be inclusive of all relevant text. IMPORTANT: The x2 and y2 coordinates must be large enough to contain the full width and height of the last tokens in that area.
- If an area is missing, return null for that specific box.
- Ensure coordinates are consistent with the provided OCR input (normalized 0-1000 plane)."#;

/// Extract the header fields from the header-area tokens.
pub const HEADER_SYSTEM_PROMPT: &str = r#"You are a specialized extraction agent for invoice headers. Your goal is to extract key metadata from the provided OCR tokens. For each field, you must provide both the 'value' and a precise 'bbox' (x1, y1, x2, y2) that encompasses the source text.

Fields to Extract:
- **invoice_number**: The unique ID (often labeled 'Invoice #', 'Bill No', 'Ref').
- **vendor_name**: Full legal name of the entity issuing the invoice.
- **client_name**: Full legal name of the entity receiving the invoice.
- **invoice_date**: Date of issue. Standardize to YYYY-MM-DD if possible.
- **due_date**: Deadline for payment. Standardize to YYYY-MM-DD if possible.

Instructions:
- Be extremely precise with bounding boxes; they should tightly wrap the relevant text.
- IMPORTANT: The 'x2' and 'y2' must reflect the bottom-right corner of the final token in the field.
- If a field is not present, return null for its object."#;

/// Extract every table row from the line-items-area tokens.
pub const LINE_ITEMS_SYSTEM_PROMPT: &str = r#"You are a specialized agent for itemizing invoice rows. Your task is to extract all line items from the provided OCR data. For each row, you must identify:
1. **description**: Full text of the service or product. Provide value and field-specific bbox.
2. **quantity**: Numeric count. Provide value and field-specific bbox.
3. **unit_price**: Price per unit. Provide value and field-specific bbox.
4. **total_price**: Line total. Provide value and field-specific bbox.
5. **bbox**: A single bounding box that encompasses the entire row (all columns).

Precision Guidelines:
- Ensure each line item object represents exactly one row in the invoice table.
- Bounding boxes must accurately reflect the coordinates in the OCR input. The 'x2' of the row bbox must match the 'x2' of the rightmost column (usually total_price), and 'y2' must match the bottom-most coordinate of that row's tokens.
- Numbers must be plain JSON numbers without currency symbols or thousands separators.
- Do not merge adjacent line items."#;

/// Extract the totals from the summary-area tokens.
pub const SUMMARY_SYSTEM_PROMPT: &str = r#"You are a specialized agent for invoice summary extraction. Your task is to extract the final financial totals. For each field, provide the 'value' and a precise 'bbox'.

Fields:
- **total_amount**: The final gross amount due (often 'Grand Total', 'Total', 'Net Payable').
- **tax_amount**: The total tax applied (often 'VAT', 'GST', 'Sales Tax').

Guidelines:
- Bounding boxes must tightly wrap the numeric value and any currency symbol if present.
- Ensure 'x2' and 'y2' include the full width and height of the last digits/tokens to avoid cropping.
- Numbers must be plain JSON numbers without currency symbols or thousands separators.
- If a field is missing, return null."#;

/// Append the reply contract (JSON only, matching the schema of `T`).
fn with_schema<T: JsonSchema>(prompt: &str) -> String {
    let schema = schemars::schema_for!(T);
    let schema = serde_json::to_string_pretty(&schema).unwrap_or_default();
    format!(
        "{prompt}\n\nReply with ONLY one JSON object that validates against this JSON Schema. \
No commentary, no markdown fences.\n\n{schema}"
    )
}

/// Wrapper the OCR step asks for, so the schema has an object at the root.
#[derive(Debug, Clone, serde::Deserialize, JsonSchema)]
pub struct OcrReply {
    pub tokens: Vec<OcrToken>,
}

pub fn ocr_system_prompt() -> String {
    with_schema::<OcrReply>(OCR_SYSTEM_PROMPT)
}

pub fn aoi_system_prompt() -> String {
    with_schema::<AreasOfInterest>(AOI_SYSTEM_PROMPT)
}

pub fn header_system_prompt() -> String {
    with_schema::<ExtractedHeader>(HEADER_SYSTEM_PROMPT)
}

pub fn line_items_system_prompt() -> String {
    with_schema::<ExtractedLineItems>(LINE_ITEMS_SYSTEM_PROMPT)
}

pub fn summary_system_prompt() -> String {
    with_schema::<ExtractedSummary>(SUMMARY_SYSTEM_PROMPT)
}

/// Render tokens one per line: `text: 'Total', x1: 700, y1: 880, x2: 760, y2: 900`.
pub fn format_tokens(tokens: &[OcrToken]) -> String {
    tokens
        .iter()
        .map(|t| {
            format!(
                "text: '{}', x1: {}, y1: {}, x2: {}, y2: {}",
                t.text, t.bbox.x1, t.bbox.y1, t.bbox.x2, t.bbox.y2
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// User message for an area-scoped step.
pub fn area_user_message(label: &str, tokens: &[OcrToken]) -> String {
    format!("{label} OCR Tokens:\n{}", format_tokens(tokens))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::BoundingBox;

    #[test]
    fn format_tokens_matches_layout() {
        let tokens = vec![
            OcrToken {
                text: "Invoice".into(),
                bbox: BoundingBox::new(10, 20, 110, 40),
                confidence: None,
            },
            OcrToken {
                text: "#42".into(),
                bbox: BoundingBox::new(120, 20, 160, 40),
                confidence: Some(0.9),
            },
        ];
        assert_eq!(
            format_tokens(&tokens),
            "text: 'Invoice', x1: 10, y1: 20, x2: 110, y2: 40\n\
             text: '#42', x1: 120, y1: 20, x2: 160, y2: 40"
        );
    }

    #[test]
    fn format_tokens_empty() {
        assert_eq!(format_tokens(&[]), "");
    }

    #[test]
    fn prompts_embed_their_schema() {
        assert!(aoi_system_prompt().contains("header_area"));
        assert!(header_system_prompt().contains("\"due_date\""));
        assert!(line_items_system_prompt().contains("\"line_items\""));
        assert!(summary_system_prompt().contains("\"tax_amount\""));
        assert!(ocr_system_prompt().contains("\"tokens\""));
    }

    #[test]
    fn area_message_has_label() {
        let msg = area_user_message("Summary Area", &[]);
        assert!(msg.starts_with("Summary Area OCR Tokens:"));
    }
}
