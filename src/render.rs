//! Text rendering of received entries.

use colored::Colorize;
use regex::{Captures, Regex};

use crate::config::FormatConfig;
use crate::error::{LoggerError, Result};
use crate::protocol::{Entity, ReceivedEntity, Severity};

const PLACEHOLDER: &str = r"\{\{(\w+)\}\}";

/// Width severity titles are padded to.
const FLAG_WIDTH: usize = 7;

#[derive(Debug, Clone)]
pub struct Renderer {
    template: Option<String>,
    time_format: String,
    color: bool,
    placeholder: Regex,
}

impl Renderer {
    pub fn new(format: &FormatConfig, color: bool) -> Result<Self> {
        let placeholder = Regex::new(PLACEHOLDER)
            .map_err(|e| LoggerError::Config(format!("placeholder pattern: {}", e)))?;
        Ok(Self {
            template: format.template.clone().filter(|t| !t.is_empty()),
            time_format: format.time_format.clone(),
            color,
            placeholder,
        })
    }

    /// Line shown on the console.
    pub fn render(&self, entry: &ReceivedEntity) -> String {
        let entity = &entry.entity;
        let device = entry.device_name.as_deref();

        let Some(template) = &self.template else {
            let line = self.raw_line(entity);
            let line = self.paint(&line, entity.severity);
            return match device {
                Some(device) if self.color => format!("{} {}", device.bold(), line),
                Some(device) => format!("{} {}", device, line),
                None => line,
            };
        };

        self.placeholder
            .replace_all(template, |caps: &Captures| match &caps[1] {
                "time" => self.time(entity),
                "flag" => self.paint(&flag_title(entity.severity), entity.severity),
                "filename" => entity.filename.clone().unwrap_or_default(),
                "line" => entity.line.map(|l| l.to_string()).unwrap_or_default(),
                "function" => entity.function.clone().unwrap_or_default(),
                "message" => self.paint(&entity.message, entity.severity),
                // Trailing space separates the name from what follows
                "device" => device.map(|d| format!("{} ", d)).unwrap_or_default(),
                _ => caps[0].to_string(),
            })
            .into_owned()
    }

    /// Uncoloured line, as persisted to log files.
    pub fn raw_line(&self, entity: &Entity) -> String {
        let mut line = format!("{} {}", self.time(entity), flag_title(entity.severity));

        if let Some(filename) = &entity.filename {
            line.push(' ');
            line.push_str(filename);
            if let Some(n) = entity.line {
                line.push_str(&format!(":{}", n));
            }
        }
        if let Some(function) = &entity.function {
            line.push(' ');
            line.push_str(function);
        }
        line.push(' ');
        line.push_str(&entity.message);
        line
    }

    fn time(&self, entity: &Entity) -> String {
        entity.datetime().format(&self.time_format).to_string()
    }

    fn paint(&self, text: &str, severity: Severity) -> String {
        if !self.color {
            return text.to_string();
        }
        match severity {
            Severity::Error => text.red().to_string(),
            Severity::Warning => text.yellow().to_string(),
            Severity::Info => text.green().to_string(),
            Severity::Debug => text.cyan().to_string(),
            Severity::Verbose => text.dimmed().to_string(),
        }
    }
}

fn flag_title(severity: Severity) -> String {
    format!("{:<width$}", severity.title(), width = FLAG_WIDTH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Identity;

    fn received(entity: Entity, device: Option<&str>) -> ReceivedEntity {
        ReceivedEntity {
            entity,
            identity: Identity::new("desk", "d", None),
            device_name: device.map(str::to_string),
        }
    }

    fn plain(template: Option<&str>) -> Renderer {
        let format = FormatConfig {
            template: template.map(str::to_string),
            time_format: "%H:%M".to_string(),
        };
        Renderer::new(&format, false).unwrap()
    }

    #[test]
    fn test_raw_line_layout() {
        let entity = Entity::new("cache miss", Severity::Info, 100).with_location(
            Some("Cache.swift".into()),
            Some(12),
            Some("lookup()".into()),
        );
        let line = plain(None).raw_line(&entity);
        assert!(line.ends_with(" INFO    Cache.swift:12 lookup() cache miss"));
    }

    #[test]
    fn test_raw_line_without_location() {
        let entity = Entity::new("bare", Severity::Warning, 100);
        let line = plain(None).raw_line(&entity);
        assert!(line.ends_with(" WARNING bare"));
    }

    #[test]
    fn test_template_placeholders() {
        let renderer = plain(Some("{{device}}[{{flag}}] {{filename}}:{{line}} {{message}} {{nope}}"));
        let entity = Entity::new("hi", Severity::Error, 100).with_location(
            Some("Main".into()),
            Some(3),
            None,
        );

        assert_eq!(
            renderer.render(&received(entity.clone(), Some("desk"))),
            "desk [ERROR  ] Main:3 hi {{nope}}"
        );
        assert_eq!(
            renderer.render(&received(entity, None)),
            "[ERROR  ] Main:3 hi {{nope}}"
        );
    }

    #[test]
    fn test_default_render_prefixes_device() {
        let renderer = plain(None);
        let entity = Entity::new("x", Severity::Debug, 100);
        let line = renderer.render(&received(entity.clone(), Some("desk")));
        assert!(line.starts_with("desk "));
        assert!(line.ends_with(&renderer.raw_line(&entity)));
    }
}
