//! Instructions sent to the vision model.
//!
//! Centralising every prompt here means changing extraction behaviour
//! (a new field, a stricter output rule) requires editing exactly one place,
//! and unit tests can inspect prompts without spinning up a real model.
//!
//! Callers can override either prompt via
//! [`crate::config::PipelineConfigBuilder::extraction_prompt`] and
//! [`crate::config::PipelineConfigBuilder::ocr_prompt`].

/// Default structured-extraction instruction.
///
/// The output contract here is the one [`crate::pipeline::schema`] enforces.
pub const EXTRACTION_PROMPT: &str = r#"You are an expert at reading invoices and receipts. Extract the document's data as JSON.

Follow these rules precisely:

1. OUTPUT SHAPE
   Return exactly one JSON object:
   {
     "fields": [
       {"label": "<field name as printed or a clear English name>", "value": "<value as printed>" or null, "confidence": <0.0-1.0>}
     ],
     "lineItems": [
       {"<column>": "<cell>", ...}
     ]
   }

2. FIELDS
   - Include, when present: Invoice Number, Invoice Date, Due Date, Vendor, Vendor Address,
     Customer, Customer Address, Subtotal, Tax, Total, Currency, Payment Terms
   - Include any other labelled header or footer values you can read
   - Copy values exactly as printed; do not convert dates, amounts or currencies
   - Use null when a field is expected but not legible

3. LINE ITEMS
   - One object per table row, keyed by the column headers as printed
   - Cell values must be strings, numbers or null (no nested objects or arrays)
   - Omit "lineItems" when the document has no item table

4. CONFIDENCE
   - 1.0 means the value is printed clearly and unambiguously
   - Below 0.5 means you are guessing

5. OUTPUT FORMAT
   - Output ONLY the JSON object
   - Do NOT wrap it in ```json fences
   - Do NOT add commentary or explanations"#;

/// Default OCR-fallback instruction.
///
/// Deliberately simpler than [`EXTRACTION_PROMPT`]: when structured
/// extraction has failed, plain text still gives a reviewer something to map.
pub const OCR_PROMPT: &str = r#"Transcribe all text in this document verbatim.

- Preserve the reading order and line breaks as printed
- Keep table rows on one line each, separating cells with " | "
- Do NOT summarise, translate, correct or interpret anything
- Do NOT add commentary, headings or markdown formatting
- Output ONLY the transcribed text"#;
