//! Messaging commands: msg, inbox, ask, reply.

use std::time::Duration;

use aqua_core::Result;

use crate::output;

/// Sends a chat message.
pub fn send(json: bool, message: &str, to: Option<&str>) -> Result<()> {
    let mut kernel = super::open()?;
    let sent = kernel.send_message(to, message)?;

    if json {
        output::print_json(&sent);
    } else {
        println!("Message sent to {}", to.unwrap_or("all"));
    }
    Ok(())
}

/// Reads the inbox, marking returned messages read.
pub fn inbox(json: bool, unread: bool, limit: u32) -> Result<()> {
    let mut kernel = super::open()?;
    let messages = kernel.inbox(unread, limit)?;

    if json {
        output::print_json(&messages);
        return Ok(());
    }

    if messages.is_empty() {
        println!("No messages.");
        return Ok(());
    }

    for message in &messages {
        let from = kernel.display_name(&message.from_agent)?;
        let to = match message.to_agent.as_deref() {
            None => " (broadcast)".to_string(),
            Some(address @ ("@leader" | "@idle")) => format!(" ({address})"),
            Some(_) => String::new(),
        };
        let when = output::time_ago(&message.created_at);
        let reply_note = message
            .reply_to
            .map_or_else(String::new, |id| format!(" [reply to #{id}]"));

        println!("#{} {when} {from}{to}{reply_note}:", message.id);
        println!("  {}", message.content);
        println!();
    }
    Ok(())
}

/// Sends a question and blocks for the reply.
pub fn ask(json: bool, message: &str, to: Option<&str>, timeout: u64) -> Result<()> {
    let mut kernel = super::open()?;
    let response = kernel.ask(to, message, Duration::from_secs(timeout))?;

    if json {
        output::print_json(&response);
    } else {
        let from = kernel.display_name(&response.from_agent)?;
        println!("{from} replied: {}", response.content);
    }
    Ok(())
}

/// Answers a question by request id.
pub fn reply(json: bool, message_id: i64, message: &str) -> Result<()> {
    let mut kernel = super::open()?;
    let sent = kernel.reply(message_id, message)?;

    if json {
        output::print_json(&sent);
    } else {
        println!("Reply sent for message #{message_id}.");
    }
    Ok(())
}
