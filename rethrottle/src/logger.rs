use std::fmt::Write;

use jiff::{Zoned, tz::TimeZone};
use log::{Level, Record};
use logforth::{
    append::Stdout,
    diagnostic::Diagnostic,
    layout::{JsonLayout, Layout},
};

use crate::args::{Args, LogStyle};

/// `<UTC timestamp> <level>  <module>: <message>`, optionally with ANSI colored levels.
#[derive(Debug, Clone, Copy)]
struct TextLayout {
    colored: bool,
}

impl Layout for TextLayout {
    fn format(&self, record: &Record<'_>, _: &[Box<dyn Diagnostic>]) -> anyhow::Result<Vec<u8>> {
        let mut output = String::new();
        let now = Zoned::now().with_time_zone(TimeZone::UTC);

        write!(output, "{} ", now.strftime("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        if self.colored {
            let color = level_color(record.level());
            write!(output, "\x1b[{color}m{:>5}\x1b[0m  ", record.level())?;
        } else {
            write!(output, "{:>5}  ", record.level())?;
        }

        if let Some(module) = record.module_path() {
            write!(output, "{module}: ")?;
        }

        write!(output, "{}", record.args())?;

        Ok(output.into_bytes())
    }
}

fn level_color(level: Level) -> u8 {
    match level {
        Level::Error => 31,
        Level::Warn => 33,
        Level::Info => 32,
        Level::Debug => 34,
        Level::Trace => 35,
    }
}

/// Install the global logger. Fails if the log filter cannot be built.
pub(super) fn init(args: &Args) -> anyhow::Result<()> {
    let filter = args.log_level.env_filter()?;

    logforth::builder()
        .dispatch(|d| {
            let d = d.filter(filter);

            match args.log_style {
                LogStyle::Color => d.append(Stdout::default().with_layout(TextLayout { colored: true })),
                LogStyle::Text => d.append(Stdout::default().with_layout(TextLayout { colored: false })),
                LogStyle::Json => d.append(Stdout::default().with_layout(JsonLayout::default())),
            }
        })
        .apply();

    Ok(())
}
