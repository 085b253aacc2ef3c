//! ObservationScope brackets one unit of recovery work
//!
//! `{name}_BEGIN` is logged on creation. The scope must then be closed with
//! `complete*` or `fail*`; a scope dropped open logs `{name}_INCOMPLETE`.
//! The fields given at creation (class, failed-node location, plan
//! generation) are repeated on every closing line, so a failure can be read
//! without its BEGIN line.

use std::cell::Cell;

use super::logger::Logger;

pub struct ObservationScope<'a> {
    name: &'a str,
    completed: Cell<bool>,
    fields: Vec<(&'a str, String)>,
}

impl<'a> ObservationScope<'a> {
    pub fn new(name: &'a str) -> Self {
        Self::with_owned_fields(name, Vec::new())
    }

    pub fn with_fields(name: &'a str, fields: &[(&'a str, &str)]) -> Self {
        Self::with_owned_fields(
            name,
            fields.iter().map(|(k, v)| (*k, v.to_string())).collect(),
        )
    }

    pub fn with_owned_fields(name: &'a str, fields: Vec<(&'a str, String)>) -> Self {
        let scope = Self {
            name,
            completed: Cell::new(false),
            fields,
        };
        Logger::info(&format!("{}_BEGIN", name), &scope.field_refs(&[]));
        scope
    }

    fn field_refs<'b>(&'b self, extra: &[(&'b str, &'b str)]) -> Vec<(&'b str, &'b str)> {
        let mut all: Vec<(&str, &str)> = self.fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        all.extend(extra.iter().copied());
        all
    }

    /// Logs `{name}_COMPLETE` at INFO.
    pub fn complete(self) {
        self.complete_with_fields(&[]);
    }

    pub fn complete_with_fields(self, extra_fields: &[(&str, &str)]) {
        self.completed.set(true);
        Logger::info(
            &format!("{}_COMPLETE", self.name),
            &self.field_refs(extra_fields),
        );
    }

    /// Logs `{name}_FAILED` at ERROR.
    pub fn fail(self, reason: &str) {
        self.completed.set(true);
        Logger::error(
            &format!("{}_FAILED", self.name),
            &self.field_refs(&[("reason", reason)]),
        );
    }

    /// Logs `{name}_FAILED` at FATAL.
    pub fn fail_fatal(self, reason: &str) {
        self.completed.set(true);
        Logger::fatal(
            &format!("{}_FAILED", self.name),
            &self.field_refs(&[("reason", reason)]),
        );
    }

    pub fn is_completed(&self) -> bool {
        self.completed.get()
    }
}

impl Drop for ObservationScope<'_> {
    fn drop(&mut self) {
        if !self.completed.get() {
            Logger::warn(
                &format!("{}_INCOMPLETE", self.name),
                &self.field_refs(&[("reason", "scope dropped without completion")]),
            );
        }
    }
}

/// Wall-clock timer for `duration_ms` fields
pub struct Timer {
    start: std::time::Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> String {
        self.start.elapsed().as_millis().to_string()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_creation() {
        let scope = ObservationScope::new("CLASS_REPLAY");
        assert!(!scope.is_completed());
        scope.complete();
    }

    #[test]
    fn test_scope_fields_carried_to_failure() {
        let scope = ObservationScope::with_owned_fields(
            "PHANTOM_PREPARE",
            vec![("location", "rs2".to_string()), ("generation", "4".to_string())],
        );
        let refs = scope.field_refs(&[("reason", "x")]);
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0], ("location", "rs2"));
        scope.fail("x");
    }

    #[test]
    fn test_scope_complete_with_extra_fields() {
        let scope = ObservationScope::with_fields("CLASS_REPLAY", &[("class", "user")]);
        scope.complete_with_fields(&[("ranges", "2")]);
    }

    #[test]
    fn test_scope_drop_without_complete() {
        let scope = ObservationScope::new("TEST");
        drop(scope);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let ms: u64 = timer.elapsed_ms().parse().unwrap();
        assert!(ms >= 10);
    }
}
