//! Delimited-row parser mapping columns positionally to harmonized fields.
//!
//! ```yaml
//! module: csv-columns
//! parameters:
//!   columns: [source.ip, __IGNORE__, event_description.text, __IGNORE__]
//!   classification_type: scanner
//!   skip_header: true
//! ```

use async_trait::async_trait;
use serde::Deserialize;

use crate::bot::{BotContext, BotError, Processor};

/// Column placeholder for cells that are not mapped to any field.
pub const IGNORE_COLUMN: &str = "__IGNORE__";

#[derive(Debug, Deserialize)]
struct CsvColumnsParams {
    columns: Vec<String>,
    #[serde(default)]
    classification_type: Option<String>,
    #[serde(default)]
    skip_header: bool,
    #[serde(default = "default_delimiter")]
    delimiter: char,
}

fn default_delimiter() -> char {
    ','
}

pub struct CsvColumnsParser {
    columns: Vec<String>,
    classification_type: Option<String>,
    skip_header: bool,
    delimiter: u8,
}

impl CsvColumnsParser {
    pub fn new(columns: Vec<String>, classification_type: Option<String>) -> Self {
        Self {
            columns,
            classification_type,
            skip_header: false,
            delimiter: b',',
        }
    }

    pub fn with_header(mut self) -> Self {
        self.skip_header = true;
        self
    }

    pub fn from_parameters(parameters: &serde_json::Value) -> Result<Self, BotError> {
        let params: CsvColumnsParams = serde_json::from_value(parameters.clone())
            .map_err(|e| BotError::Config(format!("csv-columns parameters: {}", e)))?;
        if !params.delimiter.is_ascii() {
            return Err(BotError::Config(format!(
                "csv-columns delimiter '{}' is not ASCII",
                params.delimiter
            )));
        }
        Ok(Self {
            columns: params.columns,
            classification_type: params.classification_type,
            skip_header: params.skip_header,
            delimiter: params.delimiter as u8,
        })
    }
}

#[async_trait]
impl Processor for CsvColumnsParser {
    async fn process(&mut self, ctx: &mut BotContext) -> Result<(), BotError> {
        let Some(text) = ctx.receive_message()?.raw_text()? else {
            tracing::debug!(bot_id = %ctx.bot_id(), "Report without raw payload");
            return Ok(());
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(self.skip_header)
            .delimiter(self.delimiter)
            .flexible(true)
            .from_reader(text.as_bytes());
        let separator = (self.delimiter as char).to_string();

        for record in reader.records() {
            let record = record.map_err(|e| BotError::permanent(format!("Malformed row: {}", e)))?;
            let mut event = ctx.new_event()?;

            for (column, cell) in self.columns.iter().zip(record.iter()) {
                let cell = cell.trim();
                if column.eq_ignore_ascii_case(IGNORE_COLUMN) || cell.is_empty() {
                    continue;
                }
                event.add(column, cell, true)?;
            }
            if let Some(classification) = &self.classification_type {
                event.add("classification.type", classification.as_str(), true)?;
            }
            let row: Vec<&str> = record.iter().collect();
            event.add("raw", row.join(&separator), true)?;

            ctx.send_message(event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::harmonization::HarmonizationRegistry;
    use crate::message::{Message, MessageError};
    use std::sync::Arc;

    fn context_with_raw(raw: &str) -> BotContext {
        let registry = Arc::new(HarmonizationRegistry::bundled().unwrap());
        let mut ctx = BotContext::new(
            "turris-parser",
            registry.clone(),
            Arc::new(MemoryCache::new()),
            serde_json::Value::Null,
        );
        let mut report = Message::new_report(registry);
        report.add("feed.name", "Turris Greylist", true).unwrap();
        report.add("raw", raw, true).unwrap();
        ctx.reset(Some(report));
        ctx
    }

    fn turris() -> CsvColumnsParser {
        CsvColumnsParser::from_parameters(&serde_json::json!({
            "columns": ["source.ip", "__IGNORE__", "event_description.text", "__IGNORE__"],
            "classification_type": "scanner",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_row_becomes_event() {
        let mut ctx = context_with_raw("93.184.216.34,,scanning,,");
        turris().process(&mut ctx).await.unwrap();

        let events = ctx.pending();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.value("source.ip").unwrap().as_str(), Some("93.184.216.34"));
        assert_eq!(event.value("event_description.text").unwrap().as_str(), Some("scanning"));
        assert_eq!(event.value("classification.type").unwrap().as_str(), Some("scanner"));
        assert_eq!(event.value("feed.name").unwrap().as_str(), Some("Turris Greylist"));
        assert_eq!(event.raw_text().unwrap().as_deref(), Some("93.184.216.34,,scanning,,"));
    }

    #[tokio::test]
    async fn test_header_skip_and_fan_out() {
        let mut ctx = context_with_raw(
            "Address,Tags,Event,Count\n93.184.216.34,,scanning,3\n192.0.43.8,,telnet,1\n",
        );
        turris().with_header().process(&mut ctx).await.unwrap();

        let ips: Vec<_> = ctx
            .pending()
            .iter()
            .map(|e| e.value("source.ip").unwrap().to_string())
            .collect();
        assert_eq!(ips, vec!["93.184.216.34", "192.0.43.8"]);
    }

    #[tokio::test]
    async fn test_invalid_cell_fails_the_report() {
        let mut ctx = context_with_raw("999.1.1.1,,scanning,,");
        let err = turris().process(&mut ctx).await.unwrap_err();
        assert!(matches!(
            err,
            BotError::Message(MessageError::Sanitization { .. })
                | BotError::Message(MessageError::Harmonization(_))
        ));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_parameters_require_columns() {
        assert!(matches!(
            CsvColumnsParser::from_parameters(&serde_json::json!({})),
            Err(BotError::Config(_))
        ));
    }
}
