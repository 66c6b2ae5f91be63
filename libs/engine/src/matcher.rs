//! Rule selection: which automation, if any, applies to an event.

use gf_core::Automation;

/// Lowercases and collapses whitespace so keyword comparison is stable across
/// the junk Instagram comments tend to carry.
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// A keyword matches when it appears as a substring of the normalized text.
pub fn keyword_matches(keywords: &[String], text: &str) -> bool {
    let haystack = normalize(text);
    if haystack.is_empty() {
        return false;
    }
    keywords.iter().any(|keyword| {
        let needle = normalize(keyword);
        !needle.is_empty() && haystack.contains(&needle)
    })
}

/// Picks the automation for a comment on `media_id`.
///
/// Keyword-triggered rules beat respond-to-all rules; within each tier the
/// oldest rule wins, so the outcome is deterministic for a given rule set.
/// Callers pass the list oldest-first (the store guarantees that order).
pub fn select_for_comment<'a>(
    automations: &'a [Automation],
    media_id: &str,
    text: Option<&str>,
) -> Option<&'a Automation> {
    let candidates = || {
        automations
            .iter()
            .filter(|a| a.enabled && a.applies_to_media(media_id))
    };

    if let Some(text) = text {
        if let Some(hit) = candidates().find(|a| keyword_matches(&a.keywords, text)) {
            return Some(hit);
        }
    }
    candidates().find(|a| a.respond_to_all)
}

/// Picks the automation for a direct message. Only rules without a media
/// binding apply to DMs.
pub fn select_for_dm<'a>(
    automations: &'a [Automation],
    text: Option<&str>,
) -> Option<&'a Automation> {
    let candidates = || {
        automations
            .iter()
            .filter(|a| a.enabled && a.applies_to_dms())
    };

    if let Some(text) = text {
        if let Some(hit) = candidates().find(|a| keyword_matches(&a.keywords, text)) {
            return Some(hit);
        }
    }
    candidates().find(|a| a.respond_to_all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gf_core::ReplyTemplate;

    fn automation(id: &str, created_at: i64) -> Automation {
        let mut a = Automation::new("acct", ReplyTemplate::text("hi"));
        a.id = id.into();
        a.created_at = created_at;
        a
    }

    #[test]
    fn normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize("  PRICE   Please\n"), "price please");
    }

    #[test]
    fn keyword_match_is_substring_on_normalized_text() {
        let keywords = vec!["price".to_string()];
        assert!(keyword_matches(&keywords, "What's the PRICE?"));
        assert!(!keyword_matches(&keywords, "how much"));
        assert!(!keyword_matches(&keywords, ""));
    }

    #[test]
    fn empty_keyword_never_matches() {
        let keywords = vec!["  ".to_string()];
        assert!(!keyword_matches(&keywords, "anything"));
    }

    #[test]
    fn keyword_rules_beat_respond_to_all() {
        let mut all = automation("all", 1);
        all.respond_to_all = true;
        let mut kw = automation("kw", 2);
        kw.keywords = vec!["price".into()];
        let rules = vec![all, kw];

        let hit = select_for_comment(&rules, "media", Some("price?")).unwrap();
        assert_eq!(hit.id, "kw");

        let fallback = select_for_comment(&rules, "media", Some("hello")).unwrap();
        assert_eq!(fallback.id, "all");
    }

    #[test]
    fn oldest_keyword_rule_wins_ties() {
        let mut a = automation("older", 1);
        a.keywords = vec!["promo".into()];
        let mut b = automation("newer", 2);
        b.keywords = vec!["promo".into()];
        let rules = vec![a, b];
        assert_eq!(
            select_for_comment(&rules, "m", Some("promo")).unwrap().id,
            "older"
        );
    }

    #[test]
    fn media_bound_rules_do_not_leak_across_media() {
        let mut a = automation("bound", 1);
        a.media_id = Some("media-1".into());
        a.keywords = vec!["promo".into()];
        let rules = vec![a];
        assert!(select_for_comment(&rules, "media-2", Some("promo")).is_none());
        assert!(select_for_dm(&rules, Some("promo")).is_none());
    }

    #[test]
    fn disabled_rules_never_match() {
        let mut a = automation("off", 1);
        a.respond_to_all = true;
        a.enabled = false;
        let rules = vec![a];
        assert!(select_for_comment(&rules, "m", Some("hello")).is_none());
    }

    #[test]
    fn textless_comment_only_matches_respond_to_all() {
        let mut kw = automation("kw", 1);
        kw.keywords = vec!["promo".into()];
        let mut all = automation("all", 2);
        all.respond_to_all = true;
        let rules = vec![kw, all];
        assert_eq!(select_for_comment(&rules, "m", None).unwrap().id, "all");
    }
}
