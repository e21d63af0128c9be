//! The invoice record and its pieces.
//!
//! Every coordinate lives on a normalized 0–1000 plane laid over the stitched
//! page image: `(0, 0)` is the top-left corner, `(1000, 1000)` the
//! bottom-right. Model replies are deserialised leniently (numbers written as
//! strings, bare values without a `bbox` wrapper, float coordinates) and every
//! box is normalized on the way in, so the rest of the crate can rely on
//! `x1 <= x2`, `y1 <= y2` and all coordinates inside the plane.

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Side length of the normalized coordinate plane.
pub const PLANE: i32 = 1000;

/// A rectangle on the normalized plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct BoundingBox {
    /// The top-left x-coordinate.
    pub x1: i32,
    /// The top-left y-coordinate.
    pub y1: i32,
    /// The bottom-right x-coordinate.
    pub x2: i32,
    /// The bottom-right y-coordinate.
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// The whole plane.
    pub fn full() -> Self {
        Self::new(0, 0, PLANE, PLANE)
    }

    /// Swap inverted corners and clamp to the plane.
    pub fn normalized(self) -> Self {
        let (x1, x2) = if self.x1 <= self.x2 {
            (self.x1, self.x2)
        } else {
            (self.x2, self.x1)
        };
        let (y1, y2) = if self.y1 <= self.y2 {
            (self.y1, self.y2)
        } else {
            (self.y2, self.y1)
        };
        Self {
            x1: x1.clamp(0, PLANE),
            y1: y1.clamp(0, PLANE),
            x2: x2.clamp(0, PLANE),
            y2: y2.clamp(0, PLANE),
        }
    }

    pub fn is_normalized(&self) -> bool {
        self.x1 <= self.x2
            && self.y1 <= self.y2
            && [self.x1, self.y1, self.x2, self.y2]
                .iter()
                .all(|c| (0..=PLANE).contains(c))
    }

    /// Inclusive containment: every edge of `other` lies on or inside `self`.
    pub fn contains(&self, other: &BoundingBox) -> bool {
        other.x1 >= self.x1 && other.y1 >= self.y1 && other.x2 <= self.x2 && other.y2 <= self.y2
    }

    /// Grow every edge by `margin`, staying on the plane.
    pub fn expanded(&self, margin: i32) -> Self {
        Self::new(
            self.x1 - margin,
            self.y1 - margin,
            self.x2 + margin,
            self.y2 + margin,
        )
        .normalized()
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    /// Read a box from whatever shape the model produced: an object with
    /// `x1..y2` keys, or a four-element array. Float coordinates are rounded.
    pub fn from_json(value: &Value) -> Option<Self> {
        let coords: [f64; 4] = match value {
            Value::Object(map) => [
                map.get("x1")?.as_f64()?,
                map.get("y1")?.as_f64()?,
                map.get("x2")?.as_f64()?,
                map.get("y2")?.as_f64()?,
            ],
            Value::Array(items) if items.len() == 4 => [
                items[0].as_f64()?,
                items[1].as_f64()?,
                items[2].as_f64()?,
                items[3].as_f64()?,
            ],
            _ => return None,
        };
        let [x1, y1, x2, y2] = coords.map(|c| c.round() as i32);
        Some(Self::new(x1, y1, x2, y2).normalized())
    }
}

/// A scalar that can be read leniently out of a model reply.
pub trait FieldValue: Sized {
    fn from_json(value: &Value) -> Option<Self>;
}

impl FieldValue for String {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => {
                let s = s.trim();
                (!s.is_empty()).then(|| s.to_string())
            }
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

impl FieldValue for f64 {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => parse_amount(s),
            _ => None,
        }
    }
}

/// Parse a money-like string: `"$1,234.50"`, `"1.234,50 €"`, `"(12.00)"`.
///
/// Only the first run of digits and separators is read, so trailing notes
/// like `"5.00 - 10% discount"` do not leak into the amount. A minus sign
/// counts when it touches the number (`"-12"`, `"-$12"`, `"12.00-"`), and
/// parentheses count when they wrap just the number.
///
/// With both separators present the later one is the decimal point. With
/// only commas, a final group of exactly three digits is read as thousands.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let start = raw.find(|c: char| c.is_ascii_digit())?;
    let run_len = raw[start..]
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == ','))
        .unwrap_or(raw.len() - start);
    let run = raw[start..start + run_len].trim_end_matches(['.', ',']);
    let end = start + run.len();

    let before = raw[..start].trim_end_matches(is_currency_symbol);
    let after = raw[end..].trim_start_matches(is_currency_symbol);
    let trailing_minus = after.starts_with(['-', '−'])
        && !after[after.char_indices().nth(1).map_or(after.len(), |(i, _)| i)..]
            .starts_with(|c: char| c.is_ascii_digit());
    let wrapped = before.trim_end().ends_with('(') && after.trim_start().starts_with(')');
    let negative = before.ends_with(['-', '−']) || trailing_minus || wrapped;

    let last_dot = run.rfind('.');
    let last_comma = run.rfind(',');
    let canonical = match (last_dot, last_comma) {
        (Some(d), Some(c)) if c > d => run.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => run.replace(',', ""),
        (None, Some(c)) => {
            let decimals = run.len() - c - 1;
            if decimals == 3 {
                run.replace(',', "")
            } else {
                run.replace(',', ".")
            }
        }
        _ => run.to_string(),
    };

    // A stray second dot left after the rewrites means the input was garbage.
    let value: f64 = canonical.parse().ok()?;
    Some(if negative { -value } else { value })
}

fn is_currency_symbol(c: char) -> bool {
    matches!(c, '$' | '€' | '£' | '¥' | '₹')
}

/// A value with an associated bounding box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WithValue<T> {
    pub value: T,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
}

impl<T> WithValue<T> {
    pub fn new(value: T, bbox: Option<BoundingBox>) -> Self {
        Self { value, bbox }
    }
}

impl<T: FieldValue> WithValue<T> {
    /// Accepts `{"value": .., "bbox": ..}` or a bare scalar.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Object(map) => {
                let inner = T::from_json(map.get("value")?)?;
                let bbox = map.get("bbox").and_then(BoundingBox::from_json);
                Some(Self::new(inner, bbox))
            }
            Value::Null => None,
            scalar => T::from_json(scalar).map(|v| Self::new(v, None)),
        }
    }
}

/// Serde helpers that never fail a whole reply because of one bad field.
pub(crate) mod lenient {
    use super::*;

    pub fn field<'de, D, T>(deserializer: D) -> Result<Option<WithValue<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: FieldValue,
    {
        let raw = Option::<Value>::deserialize(deserializer)?;
        Ok(raw.as_ref().and_then(WithValue::from_json))
    }

    pub fn bbox<'de, D>(deserializer: D) -> Result<Option<BoundingBox>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<Value>::deserialize(deserializer)?;
        Ok(raw.as_ref().and_then(BoundingBox::from_json))
    }

    pub fn bbox_required<'de, D>(deserializer: D) -> Result<BoundingBox, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        BoundingBox::from_json(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("not a bounding box: {raw}")))
    }
}

/// Defines the key areas of interest to be located in the invoice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AreasOfInterest {
    /// The area containing vendor name, invoice number, and dates.
    #[serde(default, deserialize_with = "lenient::bbox")]
    pub header_area: Option<BoundingBox>,
    /// The area containing the table of line items.
    #[serde(default, deserialize_with = "lenient::bbox")]
    pub line_items_area: Option<BoundingBox>,
    /// The area containing the subtotal, tax, and total amount.
    #[serde(default, deserialize_with = "lenient::bbox")]
    pub summary_area: Option<BoundingBox>,
}

/// Represents the extracted header information.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedHeader {
    #[serde(default, deserialize_with = "lenient::field")]
    pub invoice_number: Option<WithValue<String>>,
    #[serde(default, deserialize_with = "lenient::field")]
    pub vendor_name: Option<WithValue<String>>,
    #[serde(default, deserialize_with = "lenient::field")]
    pub client_name: Option<WithValue<String>>,
    #[serde(default, deserialize_with = "lenient::field")]
    pub invoice_date: Option<WithValue<String>>,
    #[serde(default, deserialize_with = "lenient::field")]
    pub due_date: Option<WithValue<String>>,
}

/// Represents a single line item in the invoice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LineItem {
    #[serde(default, deserialize_with = "lenient::field")]
    pub description: Option<WithValue<String>>,
    #[serde(default, deserialize_with = "lenient::field")]
    pub quantity: Option<WithValue<f64>>,
    #[serde(default, deserialize_with = "lenient::field")]
    pub unit_price: Option<WithValue<f64>>,
    #[serde(default, deserialize_with = "lenient::field")]
    pub total_price: Option<WithValue<f64>>,
    /// One box around the whole row.
    #[serde(default, deserialize_with = "lenient::bbox")]
    pub bbox: Option<BoundingBox>,
}

impl LineItem {
    /// A row the model returned with nothing in it.
    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.quantity.is_none()
            && self.unit_price.is_none()
            && self.total_price.is_none()
    }
}

/// Represents a list of extracted line items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedLineItems {
    /// A list of all line items extracted from the invoice.
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

/// Represents the extracted summary information.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedSummary {
    #[serde(default, deserialize_with = "lenient::field")]
    pub total_amount: Option<WithValue<f64>>,
    #[serde(default, deserialize_with = "lenient::field")]
    pub tax_amount: Option<WithValue<f64>>,
}

/// The final structured data for an invoice, including all extracted fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CompleteInvoice {
    #[schemars(title = "Invoice Number")]
    #[serde(default)]
    pub invoice_number: Option<WithValue<String>>,
    #[schemars(title = "Vendor Name")]
    #[serde(default)]
    pub vendor_name: Option<WithValue<String>>,
    #[schemars(title = "Client Name")]
    #[serde(default)]
    pub client_name: Option<WithValue<String>>,
    #[schemars(title = "Invoice Date")]
    #[serde(default)]
    pub invoice_date: Option<WithValue<String>>,
    #[schemars(title = "Due Date")]
    #[serde(default)]
    pub due_date: Option<WithValue<String>>,
    #[schemars(title = "Total Amount")]
    #[serde(default)]
    pub total_amount: Option<WithValue<f64>>,
    #[schemars(title = "Tax Amount")]
    #[serde(default)]
    pub tax_amount: Option<WithValue<f64>>,
    #[schemars(title = "Line Items")]
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

/// One recognised word on the stitched image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OcrToken {
    pub text: String,
    #[serde(deserialize_with = "lenient::bbox_required")]
    pub bbox: BoundingBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Vertical extent of one source page on the stitched image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PageSpan {
    /// 1-indexed position of the page across all uploads.
    pub page: usize,
    pub y1: i32,
    pub y2: i32,
}

/// JSON Schema of [`CompleteInvoice`], served to the viewer.
pub fn invoice_schema() -> Value {
    serde_json::to_value(schemars::schema_for!(CompleteInvoice)).unwrap_or(Value::Null)
}
