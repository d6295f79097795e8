use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use mculink_session::{NodeSnapshot, Notification};
use serde_json::json;

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

pub fn print_nodes(nodes: &[NodeSnapshot], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(nodes).unwrap_or_else(|_| "[]".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    "ID", "NAME", "SERIAL", "PROTOCOL", "APP", "REGISTERS", "CHANNELS", "MESSAGES",
                    "INVALID",
                ]);
            for node in nodes {
                table.add_row(vec![
                    node.id.to_string(),
                    node.name.clone(),
                    node.serial.clone(),
                    node.protocol_version.to_string(),
                    node.application_version.to_string(),
                    node.register_count.to_string(),
                    node.bound_channels.to_string(),
                    node.message_count.to_string(),
                    node.invalid_count.to_string(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for node in nodes {
                println!(
                    "node {} \"{}\" serial={} protocol={} app={} registers={} channels={} messages={} invalid={}",
                    node.id,
                    node.name,
                    node.serial,
                    node.protocol_version,
                    node.application_version,
                    node.register_count,
                    node.bound_channels,
                    node.message_count,
                    node.invalid_count,
                );
            }
        }
    }
}

pub fn print_notification(notification: &Notification, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", notification_json(notification)),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("{}", notification_text(notification))
        }
    }
}

fn notification_json(notification: &Notification) -> String {
    let value = match notification {
        Notification::NodeDiscovered { node_id, info } => json!({
            "event": "node-discovered",
            "node": node_id,
            "info": info,
        }),
        Notification::RegisterUpdated {
            node_id,
            offset,
            direction,
            value,
            timestamp,
        } => json!({
            "event": "register-updated",
            "node": node_id,
            "offset": offset,
            "direction": format!("{direction:?}"),
            "value": value.to_string(),
            "timestamp": timestamp,
        }),
        Notification::ChannelData { node_id, timestamp } => json!({
            "event": "channel-data",
            "node": node_id,
            "timestamp": timestamp,
        }),
        Notification::DebugString { node_id, text } => json!({
            "event": "debug-string",
            "node": node_id,
            "text": text,
        }),
        Notification::Trace { node_id, event } => json!({
            "event": "trace",
            "node": node_id,
            "level": event.level.to_string(),
            "text": event.text,
        }),
    };
    value.to_string()
}

fn notification_text(notification: &Notification) -> String {
    match notification {
        Notification::NodeDiscovered { node_id, info } => format!(
            "discovered node {} \"{}\" serial={} protocol={}",
            node_id, info.name, info.serial, info.protocol
        ),
        Notification::RegisterUpdated {
            node_id,
            offset,
            value,
            timestamp,
            ..
        } => match timestamp {
            Some(ts) => format!("node {node_id} reg 0x{offset:08X} = {value} @{ts}ms"),
            None => format!("node {node_id} reg 0x{offset:08X} = {value}"),
        },
        Notification::ChannelData { node_id, timestamp } => {
            format!("node {node_id} telemetry batch @{timestamp}ms")
        }
        Notification::DebugString { node_id, text } => {
            format!("node {node_id} says: {}", text.trim_end())
        }
        Notification::Trace { node_id, event } => {
            format!("node {node_id} [{}] {}", event.level, event.text.trim_end())
        }
    }
}
