//! The instruction prompt sent with every page image.
//!
//! The prompt and [`crate::pipeline::validate`] form one contract: the
//! prompt asks for exactly the closed `{page_content, tags, date}` object
//! the validator accepts. Change both together.
//!
//! Callers can override the default via [`crate::config::PipelineConfig::prompt`].

/// Default instruction for transcribing one handwritten page.
pub const DEFAULT_TRANSCRIBE_PROMPT: &str = r#"You are an automated document processor.
Your task is to transcribe the handwritten notes in this image into Markdown and return ONLY valid JSON and nothing else.

Rules:
- "page_content": the full transcription as a Markdown string. Use # for titles, ## for subtitles, - for bullet points and **bold** for emphasis. Preserve line breaks. Write [illegible] for any unreadable word; never invent content.
- "tags": a JSON array of 3 to 7 short topic tags for the page.
- "date": the date written on the page in DD-MM-YYYY format, or "NONE" if the page carries no date.

The JSON must be exactly: {"page_content": "<markdown string>", "tags": ["tag1", "tag2", ...], "date": "DD-MM-YYYY or NONE"}
Do not add any extra commentary, notes, or code fences."#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_names_every_schema_field() {
        for field in ["\"page_content\"", "\"tags\"", "\"date\""] {
            assert!(DEFAULT_TRANSCRIBE_PROMPT.contains(field), "missing {field}");
        }
        assert!(DEFAULT_TRANSCRIBE_PROMPT.contains("NONE"));
    }
}
