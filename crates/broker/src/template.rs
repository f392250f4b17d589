//! Stream templates: factories that lazily instantiate streams from
//! matching publish subjects, bounded by a stream-count cap.

use std::sync::Mutex;

use plexus_util::UnixMillis;

use crate::config::{TemplateConfig, TemplateInfo};
use crate::error::Error;
use crate::subject::subject_matches;

/// Deterministic stream name for a literal subject: wildcard-unsafe
/// characters collapse to `_` (`kv.22` -> `kv_22`).
pub fn canonical_name(subject: &str) -> String {
    subject
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' | ' ' => '_',
            c => c,
        })
        .collect()
}

#[derive(Debug)]
pub struct StreamTemplate {
    config: TemplateConfig,
    created: UnixMillis,
    streams: Mutex<Vec<String>>,
}

impl StreamTemplate {
    pub fn new(config: TemplateConfig, created: UnixMillis) -> Self {
        Self {
            config,
            created,
            streams: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn created(&self) -> UnixMillis {
        self.created
    }

    pub fn config(&self) -> &TemplateConfig {
        &self.config
    }

    pub fn matches(&self, subject: &str) -> bool {
        self.config
            .config
            .subjects
            .iter()
            .any(|p| subject_matches(p, subject))
    }

    /// Claim a slot for a newly derived stream. The cap counts live
    /// streams, so deletes free slots.
    pub fn try_register_stream(&self, name: &str) -> Result<(), Error> {
        let mut streams = self.streams.lock().expect("template lock");
        if streams.iter().any(|s| s == name) {
            return Ok(());
        }
        if streams.len() >= self.config.max_streams as usize {
            return Err(Error::MaxStreamsExceeded);
        }
        streams.push(name.to_string());
        Ok(())
    }

    pub fn unregister_stream(&self, name: &str) {
        self.streams.lock().expect("template lock").retain(|s| s != name);
    }

    pub fn stream_names(&self) -> Vec<String> {
        self.streams.lock().expect("template lock").clone()
    }

    pub fn info(&self) -> TemplateInfo {
        TemplateInfo {
            config: self.config.clone(),
            streams: self.stream_names(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;

    fn template(max: u32) -> StreamTemplate {
        let mut sc = StreamConfig::new("kv");
        sc.subjects = vec!["kv.*".into()];
        StreamTemplate::new(
            TemplateConfig {
                name: "kv".into(),
                config: sc,
                max_streams: max,
            },
            0,
        )
    }

    #[test]
    fn canonical_names() {
        assert_eq!(canonical_name("kv.22"), "kv_22");
        assert_eq!(canonical_name("a.b.c"), "a_b_c");
        assert_eq!(canonical_name("plain"), "plain");
    }

    #[test]
    fn caps_derived_streams() {
        let t = template(2);
        assert!(t.matches("kv.one"));
        assert!(!t.matches("other"));
        t.try_register_stream("kv_one").unwrap();
        t.try_register_stream("kv_two").unwrap();
        // Re-registering an existing stream is not a new slot.
        t.try_register_stream("kv_one").unwrap();
        assert!(matches!(
            t.try_register_stream("kv_three"),
            Err(Error::MaxStreamsExceeded)
        ));
        t.unregister_stream("kv_one");
        t.try_register_stream("kv_three").unwrap();
        assert_eq!(t.stream_names().len(), 2);
    }
}
