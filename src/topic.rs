//! ==============================================================================
//! topic.rs - subscription registry, wildcard matching and topic rewriting
//! ==============================================================================
//!
//! purpose:
//!     keeps the handler table for mqtt subscriptions and relocates device
//!     topics from the ingest namespace to the publish namespace.
//!
//! topic syntax:
//!     segments separated by '/'
//!     '+' matches exactly one segment
//!     '#' matches one or more trailing segments, last segment only
//!     concrete (received) topics never contain either token
//!
//! relationships:
//!     - used by: runtime.rs (dispatch), forwarder.rs (TopicRewriter)
//!
//! ==============================================================================

use crate::error::TopicError;
use regex::Regex;
use std::collections::HashMap;

pub const SINGLE_LEVEL_WILDCARD: &str = "+";
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// does the topic contain a wildcard token?
pub fn has_wildcards(topic: &str) -> bool {
    topic.contains('+') || topic.contains('#')
}

// ==============================================================================
// compiled pattern
// ==============================================================================

/// a subscription pattern compiled into an anchored, segment-wise regex
#[derive(Debug, Clone)]
pub struct TopicPattern {
    pattern: String,
    regex: Regex,
    wildcards: usize,
}

impl TopicPattern {
    pub fn compile(pattern: &str) -> Result<Self, TopicError> {
        let invalid = |reason| TopicError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };

        if pattern.is_empty() {
            return Err(invalid("pattern is empty"));
        }

        let segments: Vec<&str> = pattern.split('/').collect();
        let last = segments.len() - 1;
        let mut expr = String::from("^");
        let mut wildcards = 0;

        for (i, segment) in segments.iter().enumerate() {
            if i > 0 {
                expr.push('/');
            }
            match *segment {
                SINGLE_LEVEL_WILDCARD => {
                    expr.push_str("([^/]+)");
                    wildcards += 1;
                }
                MULTI_LEVEL_WILDCARD => {
                    if i != last {
                        return Err(invalid("'#' must be the last segment"));
                    }
                    expr.push_str("(.+)");
                    wildcards += 1;
                }
                literal => {
                    if has_wildcards(literal) {
                        return Err(invalid("wildcards must occupy a whole segment"));
                    }
                    expr.push_str(&regex::escape(literal));
                }
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|_| invalid("pattern does not compile"))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            wildcards,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn has_wildcards(&self) -> bool {
        self.wildcards > 0
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.regex.is_match(topic)
    }

    /// one captured string per wildcard, left to right
    pub fn captures(&self, topic: &str) -> Option<Vec<String>> {
        let caps = self.regex.captures(topic)?;
        Some(
            caps.iter()
                .skip(1)
                .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect(),
        )
    }
}

// ==============================================================================
// topic rewriting
// ==============================================================================

/// rewrites `concrete` from the `source` pattern to the `destination` pattern
///
/// captures fill destination wildcards in order. a capture is only used when
/// it is non-empty and not "0"; the first destination wildcard without a
/// usable capture ends the result. returns "" when the source does not match.
pub fn rewrite_topic(source: &str, destination: &str, concrete: &str) -> String {
    match TopicPattern::compile(source) {
        Ok(pattern) => rewrite_with(&pattern, destination, concrete),
        Err(_) => String::new(),
    }
}

fn rewrite_with(source: &TopicPattern, destination: &str, concrete: &str) -> String {
    let Some(captures) = source.captures(concrete) else {
        return String::new();
    };
    let mut captures = captures.into_iter();

    let mut parts: Vec<String> = Vec::new();
    for segment in destination.split('/') {
        if segment == SINGLE_LEVEL_WILDCARD || segment == MULTI_LEVEL_WILDCARD {
            match captures.next() {
                Some(capture) if !capture.is_empty() && capture != "0" => parts.push(capture),
                _ => break,
            }
        } else {
            parts.push(segment.to_string());
        }
    }

    parts.join("/")
}

/// a fixed source -> destination mapping with the source compiled once
#[derive(Debug, Clone)]
pub struct TopicRewriter {
    source: TopicPattern,
    destination: String,
}

impl TopicRewriter {
    pub fn new(source: &str, destination: &str) -> Result<Self, TopicError> {
        Ok(Self {
            source: TopicPattern::compile(source)?,
            destination: destination.to_string(),
        })
    }

    pub fn rewrite(&self, concrete: &str) -> String {
        rewrite_with(&self.source, &self.destination, concrete)
    }

    pub fn source(&self) -> &str {
        self.source.as_str()
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }
}

// ==============================================================================
// registry
// ==============================================================================

struct Subscription<H> {
    /// only present for wildcard patterns
    matcher: Option<TopicPattern>,
    handler: H,
}

/// pattern -> handler table
///
/// with no wildcard patterns registered, dispatch is a plain map lookup.
pub struct TopicRegistry<H> {
    subscriptions: HashMap<String, Subscription<H>>,
    wildcard_count: usize,
}

impl<H: Clone> TopicRegistry<H> {
    pub fn new() -> Self {
        Self {
            subscriptions: HashMap::new(),
            wildcard_count: 0,
        }
    }

    /// stores `handler` under `pattern`, replacing any previous handler
    pub fn register(&mut self, pattern: &str, handler: H) -> Result<(), TopicError> {
        let matcher = if has_wildcards(pattern) {
            Some(TopicPattern::compile(pattern)?)
        } else if pattern.is_empty() {
            return Err(TopicError::InvalidPattern {
                pattern: String::new(),
                reason: "pattern is empty",
            });
        } else {
            None
        };

        let is_wildcard = matcher.is_some();
        let previous = self
            .subscriptions
            .insert(pattern.to_string(), Subscription { matcher, handler });

        if previous.is_some_and(|p| p.matcher.is_some()) {
            self.wildcard_count -= 1;
        }
        if is_wildcard {
            self.wildcard_count += 1;
        }
        Ok(())
    }

    /// removes `pattern`; unknown patterns are a no-op returning false
    pub fn unregister(&mut self, pattern: &str) -> bool {
        match self.subscriptions.remove(pattern) {
            Some(sub) => {
                if sub.matcher.is_some() {
                    self.wildcard_count -= 1;
                }
                true
            }
            None => false,
        }
    }

    /// every handler whose pattern matches the concrete topic
    pub fn dispatch(&self, topic: &str) -> Result<Vec<H>, TopicError> {
        if has_wildcards(topic) {
            return Err(TopicError::InvalidTopic(topic.to_string()));
        }

        if self.wildcard_count == 0 {
            return Ok(self
                .subscriptions
                .get(topic)
                .map(|s| vec![s.handler.clone()])
                .unwrap_or_default());
        }

        Ok(self
            .subscriptions
            .iter()
            .filter(|(pattern, sub)| match &sub.matcher {
                Some(matcher) => matcher.matches(topic),
                None => pattern.as_str() == topic,
            })
            .map(|(_, sub)| sub.handler.clone())
            .collect())
    }

    /// rewrites using the registered, already compiled source pattern when
    /// there is one
    pub fn rewrite(&self, source: &str, destination: &str, concrete: &str) -> String {
        match self.subscriptions.get(source).and_then(|s| s.matcher.as_ref()) {
            Some(matcher) => rewrite_with(matcher, destination, concrete),
            None => rewrite_topic(source, destination, concrete),
        }
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.keys().map(String::as_str)
    }

    pub fn wildcard_count(&self) -> usize {
        self.wildcard_count
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

impl<H: Clone> Default for TopicRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn registry() -> TopicRegistry<&'static str> {
        TopicRegistry::new()
    }

    #[test]
    fn exact_dispatch_returns_only_registered_handler() {
        let mut reg = registry();
        reg.register("a/b", "ab").unwrap();
        reg.register("a/c", "ac").unwrap();

        assert_eq!(reg.dispatch("a/b").unwrap(), vec!["ab"]);
        assert!(reg.dispatch("a/d").unwrap().is_empty());
        assert_eq!(reg.wildcard_count(), 0);
    }

    #[test]
    fn wildcard_patterns_match_segment_for_segment() {
        let mut reg = registry();
        reg.register("a/+/c/#", "wild").unwrap();

        assert_eq!(reg.dispatch("a/x/c/d/e").unwrap(), vec!["wild"]);
        assert_eq!(reg.dispatch("a/x/c/d").unwrap(), vec!["wild"]);
        assert!(reg.dispatch("a/x/y/c/d").unwrap().is_empty());
        assert!(reg.dispatch("a/x/c").unwrap().is_empty());
    }

    #[test]
    fn all_matching_handlers_fire() {
        let mut reg = registry();
        reg.register("sensors/+/temp", "plus").unwrap();
        reg.register("sensors/#", "hash").unwrap();
        reg.register("sensors/room1/temp", "exact").unwrap();

        let mut handlers = reg.dispatch("sensors/room1/temp").unwrap();
        handlers.sort();
        assert_eq!(handlers, vec!["exact", "hash", "plus"]);
    }

    #[test]
    fn dispatch_rejects_wildcard_topics() {
        let reg = registry();
        assert_eq!(
            reg.dispatch("a/+/b"),
            Err(TopicError::InvalidTopic("a/+/b".to_string()))
        );
        assert!(reg.dispatch("a/#").is_err());
    }

    #[test]
    fn re_registering_replaces_handler() {
        let mut reg = registry();
        reg.register("a/+", "first").unwrap();
        reg.register("a/+", "second").unwrap();

        assert_eq!(reg.dispatch("a/b").unwrap(), vec!["second"]);
        assert_eq!(reg.wildcard_count(), 1);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn unregister_keeps_counter_consistent() {
        let mut reg = registry();
        reg.register("a/+", "wild").unwrap();
        reg.register("a/b", "exact").unwrap();

        assert!(reg.unregister("a/+"));
        assert_eq!(reg.wildcard_count(), 0);
        assert!(!reg.unregister("a/+"));
        assert_eq!(reg.wildcard_count(), 0);

        assert_eq!(reg.dispatch("a/b").unwrap(), vec!["exact"]);
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        let mut reg = registry();
        assert!(reg.register("a/#/b", "x").is_err());
        assert!(reg.register("a/b+/c", "x").is_err());
        assert!(reg.register("", "x").is_err());
        assert_eq!(reg.wildcard_count(), 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn literal_segments_are_escaped() {
        let pattern = TopicPattern::compile("a.b/+/(c)").unwrap();
        assert!(pattern.matches("a.b/x/(c)"));
        assert!(!pattern.matches("aXb/x/(c)"));
    }

    #[test]
    fn rewrite_substitutes_captures_in_order() {
        assert_eq!(
            rewrite_topic("a/+/b/#", "c/+/RTL/#", "a/X/b/d/e"),
            "c/X/RTL/d/e"
        );
    }

    #[test]
    fn rewrite_relocates_gateway_topics() {
        let rewriter = TopicRewriter::new(
            "433_direct/raw/+/RTL_433toMQTT/#",
            "433_direct/+/RTL_433toMQTT/#",
        )
        .unwrap();

        assert_eq!(
            rewriter.rewrite("433_direct/raw/OMG_lilygo_rtl_433_ESP_2/RTL_433toMQTT/Acurite-6045M/A/164"),
            "433_direct/OMG_lilygo_rtl_433_ESP_2/RTL_433toMQTT/Acurite-6045M/A/164"
        );
    }

    #[test]
    fn rewrite_without_match_is_empty() {
        assert_eq!(rewrite_topic("a/+/b/#", "c/+/#", "z/X/b/d"), "");
        assert_eq!(rewrite_topic("a/#/b", "c/#", "a/x/b"), "");
    }

    #[test]
    fn rewrite_stops_at_unusable_capture() {
        // "0" is never substituted
        assert_eq!(rewrite_topic("a/+/b/#", "c/+/RTL/#", "a/0/b/d"), "c");
        // more destination wildcards than captures
        assert_eq!(rewrite_topic("a/+", "c/+/d/+/e", "a/X"), "c/X/d");
        // literal source, nothing captured
        assert_eq!(rewrite_topic("a/b", "c/d/+", "a/b"), "c/d");
    }

    #[test]
    fn registry_rewrite_uses_registered_pattern() {
        let mut reg = registry();
        reg.register("src/+/#", "h").unwrap();
        assert_eq!(reg.rewrite("src/+/#", "dst/+/#", "src/dev1/Tower/A/5476"), "dst/dev1/Tower/A/5476");
        assert_eq!(reg.rewrite("other/+", "dst/+", "other/x"), "dst/x");
    }

    proptest! {
        #[test]
        fn exact_patterns_only_dispatch_to_themselves(
            a in "[a-z0-9_]{1,8}(/[a-z0-9_]{1,8}){0,4}",
            b in "[a-z0-9_]{1,8}(/[a-z0-9_]{1,8}){0,4}",
        ) {
            let mut reg = TopicRegistry::new();
            reg.register(&a, a.clone()).unwrap();
            prop_assert_eq!(reg.dispatch(&a).unwrap(), vec![a.clone()]);
            if a != b {
                prop_assert!(reg.dispatch(&b).unwrap().is_empty());
            }
        }

        #[test]
        fn single_level_wildcard_matches_any_one_segment(
            head in "[a-z]{1,6}",
            middle in "[a-zA-Z0-9_-]{1,10}",
            tail in "[a-z]{1,6}",
        ) {
            let pattern = TopicPattern::compile(&format!("{}/+/{}", head, tail)).unwrap();
            let topic = format!("{}/{}/{}", head, middle, tail);
            prop_assert!(pattern.matches(&topic));
            prop_assert_eq!(pattern.captures(&topic), Some(vec![middle.clone()]));

            let too_deep = format!("{}/{}/x/{}", head, middle, tail);
            prop_assert!(!pattern.matches(&too_deep));
        }
    }
}
