//! Board and notification views.

use anyhow::Result;
use serde_json::json;

use repopilot::config::Settings;

use super::tasks::print_task_rows;
use super::{open_store, print_json};
use crate::NotificationCommands;

pub fn cmd_board(settings: &Settings, json: bool, repo: Option<&str>) -> Result<()> {
    let store = open_store(settings)?;
    let board = store.blocking().board(repo)?;
    if json {
        return print_json(&json!({
            "columns": board.columns,
            "counts": board.counts(),
        }));
    }
    for column in &board.columns {
        println!();
        println!("== {} ({}) ==", column.column, column.count);
        if !column.tasks.is_empty() {
            print_task_rows(&column.tasks);
        }
    }
    println!();
    Ok(())
}

pub fn cmd_notifications(
    settings: &Settings,
    json: bool,
    command: Option<NotificationCommands>,
) -> Result<()> {
    let store = open_store(settings)?;
    let command = command.unwrap_or(NotificationCommands::List {
        unread: false,
        limit: 50,
    });

    match command {
        NotificationCommands::List { unread, limit } => {
            let notifications = store.blocking().list_notifications(unread, limit)?;
            if json {
                return print_json(&notifications);
            }
            if notifications.is_empty() {
                println!("No notifications.");
            }
            for n in &notifications {
                let marker = if n.read { " " } else { "*" };
                println!(
                    "{marker} {} {:<7} {:<12} {}",
                    n.created_at.format("%Y-%m-%d %H:%M"),
                    n.kind.as_str(),
                    n.task_id,
                    n.title
                );
                if !n.body.is_empty() {
                    println!("    {}", n.body);
                }
            }
        }
        NotificationCommands::Read { id } => {
            let changed = store.blocking().mark_notifications_read(id.as_deref())?;
            if id.is_some() && changed == 0 {
                let known = store
                    .blocking()
                    .list_notifications(false, usize::MAX)?
                    .iter()
                    .any(|n| Some(&n.id) == id.as_ref());
                if !known {
                    anyhow::bail!("Notification {} not found", id.unwrap_or_default());
                }
            }
            if json {
                return print_json(&json!({ "marked_read": changed }));
            }
            println!("Marked {changed} notification(s) read.");
        }
    }
    Ok(())
}
