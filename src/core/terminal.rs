use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static TOOL_ICON: Emoji<'_, '_> = Emoji("🔧 ", "> ");
pub static QUERY_ICON: Emoji<'_, '_> = Emoji("🔍 ", "? ");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

/// Progress lines go to stderr so stdout carries only the answer.
pub fn print_tool_call(name: &str) {
    eprintln!("{} {}", TOOL_ICON, style(name).dim());
}

pub fn print_query(question: &str, failed: bool) {
    let line = if failed {
        style(format!("{} (failed)", question)).red().dim()
    } else {
        style(question.to_string()).dim()
    };
    eprintln!("  {} {}", QUERY_ICON, line);
}

pub fn print_banner() {
    let lines: &[&str] = &[
        "     _       _        _                   ",
        "  __| | __ _| |_ __ _| | ___   ___  _ __  ",
        " / _` |/ _` | __/ _` | |/ _ \\ / _ \\| '_ \\ ",
        "| (_| | (_| | || (_| | | (_) | (_) | |_) |",
        " \\__,_|\\__,_|\\__\\__,_|_|\\___/ \\___/| .__/ ",
        "                                   |_|    ",
    ];

    // Gradient: #818cf8 → #22d3ee, left to right
    let from = (129u8, 140u8, 248u8);
    let to = (34u8, 211u8, 238u8);
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(1) as u32;

    println!();
    for line in lines {
        for (x, ch) in line.chars().enumerate() {
            if ch == ' ' {
                print!(" ");
                continue;
            }
            let t = (x as u32 * 1000 / width).min(1000);
            let (r, g, b) = lerp_color(from, to, t);
            print!("\x1b[38;2;{};{};{}m{}", r, g, b, ch);
        }
        println!();
    }
    print!("\x1b[0m");

    println!("\x1b[38;2;34;211;238mAsk your data a question.\x1b[0m\n");
}

fn lerp_color(a: (u8, u8, u8), b: (u8, u8, u8), t: u32) -> (u8, u8, u8) {
    let r = (a.0 as u32 * (1000 - t) + b.0 as u32 * t) / 1000;
    let g = (a.1 as u32 * (1000 - t) + b.1 as u32 * t) / 1000;
    let b_val = (a.2 as u32 * (1000 - t) + b.2 as u32 * t) / 1000;
    (r as u8, g as u8, b_val as u8)
}

/// A titled block of aligned lines for help and summaries.
pub struct GuideSection {
    title: String,
    lines: Vec<String>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, about: &str) -> Self {
        self.lines
            .push(format!("  {} {}", style(format!("{:<22}", name)).green(), about));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines
            .push(format!("  {} {}", style(format!("{}:", label)).bold(), value));
        self
    }

    pub fn text(mut self, line: &str) -> Self {
        self.lines.push(format!("  {}", line));
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(String::new());
        self
    }

    pub fn print(&self) {
        println!("\n{} {}", SPARKLE, style(&self.title).bold().cyan());
        for line in &self.lines {
            println!("{}", line);
        }
    }
}
