use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use kernelmux_wire::{msg_id, Channel, RawMessage};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// One inbound kernel message as printed by `execute`.
#[derive(Serialize)]
pub struct MessageOutput {
    pub channel: Channel,
    pub msg_type: String,
    pub msg_id: Option<String>,
    pub parent_msg_id: Option<String>,
    pub cell_id: Option<String>,
    pub content: Value,
}

impl MessageOutput {
    pub fn new(channel: Channel, message: &RawMessage) -> Self {
        let parent_msg_id = message.parent_msg_id();
        let cell_id = parent_msg_id
            .as_deref()
            .and_then(|id| msg_id::decode(id).cell_id);
        let content = message
            .parts()
            .get(kernelmux_wire::message::CONTENT)
            .and_then(|raw| serde_json::from_slice(raw).ok())
            .unwrap_or(Value::Null);
        Self {
            channel,
            msg_type: message.msg_type().unwrap_or_default(),
            msg_id: message.msg_id(),
            parent_msg_id,
            cell_id,
            content,
        }
    }
}

pub fn print_message(out: &MessageOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CHANNEL", "TYPE", "CELL", "CONTENT"])
                .add_row(vec![
                    out.channel.to_string(),
                    out.msg_type.clone(),
                    out.cell_id.clone().unwrap_or_else(|| "-".to_string()),
                    content_preview(&out.content),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "[{}] {} cell={} {}",
                out.channel,
                out.msg_type,
                out.cell_id.as_deref().unwrap_or("-"),
                content_preview(&out.content)
            );
        }
    }
}

/// Print a flat record: one JSON line, a two-column table, or `key: value`
/// lines.
pub fn print_record<T: Serialize>(record: &T, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(record),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (field, value) in record_fields(record) {
                table.add_row(vec![field, value]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for (field, value) in record_fields(record) {
                println!("{field}: {value}");
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn record_fields<T: Serialize>(record: &T) -> Vec<(String, String)> {
    match serde_json::to_value(record) {
        Ok(Value::Object(fields)) => fields
            .into_iter()
            .map(|(field, value)| (field, scalar_text(&value)))
            .collect(),
        _ => Vec::new(),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn content_preview(content: &Value) -> String {
    match content {
        Value::Object(fields) => match fields.get("text").or_else(|| fields.get("execution_state")) {
            Some(Value::String(text)) => text.trim_end().to_string(),
            _ => content.to_string(),
        },
        other => other.to_string(),
    }
}
