use std::io::Write;

use dataloop::core::workflow::prompt::FOLLOW_UPS_OPEN;

/// Prints streamed model text as it arrives, stopping at the follow-up
/// trailer. A fragment that might be the start of the trailer tag is held
/// back until the next one settles it.
#[derive(Default)]
pub(crate) struct AnswerPrinter {
    segment: String,
    printed: usize,
    stopped: bool,
}

impl AnswerPrinter {
    pub fn push(&mut self, text: &str) {
        let out = self.take(text);
        if !out.is_empty() {
            print!("{}", out);
            let _ = std::io::stdout().flush();
        }
    }

    /// Whether the current segment carried any visible text.
    pub fn streamed_segment(&self) -> bool {
        !self.segment.trim().is_empty()
    }

    /// End the current segment, e.g. before a tool call line.
    pub fn break_segment(&mut self) {
        if self.printed > 0 && !self.segment[..self.printed].ends_with('\n') {
            println!();
        }
        self.segment.clear();
        self.printed = 0;
        self.stopped = false;
    }

    /// Print whatever is still held back, then end the segment.
    pub fn finish(&mut self) {
        if !self.stopped && self.printed < self.segment.len() {
            print!("{}", &self.segment[self.printed..]);
            self.printed = self.segment.len();
        }
        if self.printed > 0 {
            println!();
        }
        self.segment.clear();
        self.printed = 0;
        self.stopped = false;
    }

    fn take(&mut self, text: &str) -> String {
        if self.stopped {
            return String::new();
        }
        self.segment.push_str(text);
        if let Some(idx) = self.segment.find(FOLLOW_UPS_OPEN) {
            self.stopped = true;
            let out = self.segment[self.printed..idx].trim_end().to_string();
            self.printed = idx;
            return out;
        }
        let len = self.segment.len();
        let hold = (1..FOLLOW_UPS_OPEN.len())
            .rev()
            .find(|&n| {
                n <= len
                    && self.segment.is_char_boundary(len - n)
                    && FOLLOW_UPS_OPEN.starts_with(&self.segment[len - n..])
            })
            .unwrap_or(0);
        let upto = len - hold;
        if upto <= self.printed {
            return String::new();
        }
        let out = self.segment[self.printed..upto].to_string();
        self.printed = upto;
        out
    }
}
