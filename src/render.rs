use std::io::Write;

use crate::error::{ErrorContext, StoreError};
use crate::model::{Listing, ReactionKind};
use crate::thread::ThreadEntry;

/// Consumer of everything the controller produces.
pub trait RenderSink {
    fn show_posts(&mut self, channel: &str, posts: &[ThreadEntry]);
    fn show_workspaces(&mut self, workspaces: &[Listing]);
    fn show_channels(&mut self, workspace: &str, channels: &[Listing]);
    fn show_error(&mut self, error: &StoreError, context: &ErrorContext);
    fn channel_closed(&mut self, _channel: &str) {}
}

const INDENT: &str = "    ";

pub struct TerminalRenderer<W: Write> {
    out: W,
}

impl<W: Write> TerminalRenderer<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, text: &str) {
        let _ = self.out.write_all(text.as_bytes());
        let _ = self.out.flush();
    }
}

pub fn format_thread(channel: &str, posts: &[ThreadEntry]) -> String {
    let mut text = format!("== {channel} ({} posts)\n", posts.len());
    for entry in posts {
        let indent = INDENT.repeat(entry.depth);
        let author = if entry.post.meta.created_by.is_empty() {
            "unknown"
        } else {
            entry.post.meta.created_by.as_str()
        };
        text.push_str(&format!("{indent}{author}: {}", entry.post.doc.msg));
        if let Some(reactions) = &entry.post.doc.reactions {
            let tally = ReactionKind::ALL
                .iter()
                .filter(|kind| reactions.count(**kind) > 0)
                .map(|kind| format!("{} {}", kind.as_str(), reactions.count(*kind)))
                .collect::<Vec<_>>();
            if !tally.is_empty() {
                text.push_str(&format!("  [{}]", tally.join(", ")));
            }
        }
        text.push('\n');
    }
    text
}

impl<W: Write> RenderSink for TerminalRenderer<W> {
    fn show_posts(&mut self, channel: &str, posts: &[ThreadEntry]) {
        let text = format_thread(channel, posts);
        self.emit(&text);
    }

    fn show_workspaces(&mut self, workspaces: &[Listing]) {
        let names: Vec<&str> = workspaces.iter().map(Listing::name).collect();
        self.emit(&format!("workspaces: {}\n", names.join(", ")));
    }

    fn show_channels(&mut self, workspace: &str, channels: &[Listing]) {
        let names: Vec<&str> = channels.iter().map(Listing::name).collect();
        self.emit(&format!("channels in {workspace}: {}\n", names.join(", ")));
    }

    fn show_error(&mut self, error: &StoreError, context: &ErrorContext) {
        let message = context.user_message(error);
        self.emit(&format!("error ({}): {message}\n", error.code()));
    }

    fn channel_closed(&mut self, channel: &str) {
        self.emit(&format!("closed {channel}\n"));
    }
}
