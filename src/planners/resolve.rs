//! 按名称消解目标实体
//!
//! 顺序：指代词取最近一次出现的同类实体；最近出现过的实体优先；
//! 然后逐级模糊匹配（完全相同 → 输入包含于标题 → 标题包含于输入 → 字符重合度 ≥ 0.6）。
//! 某一级命中多个时返回 Ambiguous，由 Planner 转为澄清，不替用户猜。

use crate::memory::EntityRef;

/// 候选实体
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    pub title: String,
}

impl Candidate {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(Candidate),
    Ambiguous(Vec<Candidate>),
    NotFound,
}

const PRONOUNS: &[&str] = &["it", "that", "this", "that one", "this one", "the last one", "the one"];

pub const SIMILARITY_THRESHOLD: f64 = 0.6;

/// 字符重合度：去掉非字母数字后，公共字符数 / 较长串长度
pub fn similarity(a: &str, b: &str) -> f64 {
    let clean = |s: &str| -> Vec<char> {
        s.chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect()
    };
    let a = clean(a);
    let mut b = clean(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let max_len = a.len().max(b.len());
    if a == b {
        return 1.0;
    }
    let mut common = 0usize;
    for c in &a {
        if let Some(pos) = b.iter().position(|x| x == c) {
            b.swap_remove(pos);
            common += 1;
        }
    }
    common as f64 / max_len as f64
}

/// 在一组候选中逐级匹配；返回最优一级的全部命中
fn tiered_match(name: &str, candidates: &[Candidate]) -> Vec<Candidate> {
    let needle = name.trim().to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }

    let exact: Vec<Candidate> = candidates
        .iter()
        .filter(|c| c.title.to_lowercase() == needle)
        .cloned()
        .collect();
    if !exact.is_empty() {
        return exact;
    }

    let contained: Vec<Candidate> = candidates
        .iter()
        .filter(|c| c.title.to_lowercase().contains(&needle))
        .cloned()
        .collect();
    if !contained.is_empty() {
        return contained;
    }

    // 标题包含于输入：最长的标题覆盖其余命中时才算唯一
    let containing: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| !c.title.is_empty() && needle.contains(&c.title.to_lowercase()))
        .collect();
    if let Some(longest) = containing.iter().max_by_key(|c| c.title.chars().count()) {
        let outer = longest.title.to_lowercase();
        if containing.iter().all(|c| outer.contains(&c.title.to_lowercase())) {
            return vec![(*longest).clone()];
        }
        return containing.into_iter().cloned().collect();
    }

    let scored: Vec<(f64, &Candidate)> = candidates
        .iter()
        .map(|c| (similarity(&needle, &c.title), c))
        .filter(|(s, _)| *s >= SIMILARITY_THRESHOLD)
        .collect();
    let best = scored.iter().map(|(s, _)| *s).fold(0.0_f64, f64::max);
    scored
        .into_iter()
        .filter(|(s, _)| (*s - best).abs() < f64::EPSILON)
        .map(|(_, c)| c.clone())
        .collect()
}

fn decide(mut matches: Vec<Candidate>) -> Resolution {
    match matches.len() {
        0 => Resolution::NotFound,
        1 => Resolution::Found(matches.remove(0)),
        _ => Resolution::Ambiguous(matches),
    }
}

/// 消解 name 指向的实体；recent 为同类实体最近出现顺序（新的在前）
pub fn resolve(name: &str, candidates: &[Candidate], recent: &[EntityRef]) -> Resolution {
    let lowered = name.trim().to_lowercase();

    if PRONOUNS.contains(&lowered.as_str()) || lowered.is_empty() {
        return recent
            .iter()
            .find_map(|r| candidates.iter().find(|c| c.id == r.id))
            .cloned()
            .map(Resolution::Found)
            .unwrap_or(Resolution::NotFound);
    }

    // 直接给出 id
    if let Some(c) = candidates.iter().find(|c| c.id == name.trim()) {
        return Resolution::Found(c.clone());
    }

    let recent_candidates: Vec<Candidate> = recent
        .iter()
        .filter_map(|r| candidates.iter().find(|c| c.id == r.id))
        .cloned()
        .collect();
    if let Resolution::Found(c) = decide(tiered_match(name, &recent_candidates)) {
        return Resolution::Found(c);
    }

    decide(tiered_match(name, candidates))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::EntityKind;

    fn candidates() -> Vec<Candidate> {
        vec![
            Candidate::new("1", "Buy milk"),
            Candidate::new("2", "Buy milk and eggs"),
            Candidate::new("3", "Call mom"),
            Candidate::new("4", "Call dad"),
            Candidate::new("5", "Submit Q3 Financial Report"),
        ]
    }

    fn recent(id: &str) -> EntityRef {
        EntityRef {
            kind: EntityKind::Task,
            id: id.into(),
            title: String::new(),
        }
    }

    #[test]
    fn test_exact_match_case_insensitive() {
        assert_eq!(resolve("buy MILK", &candidates(), &[]), Resolution::Found(Candidate::new("1", "Buy milk")));
    }

    #[test]
    fn test_several_partial_matches_ask_instead_of_guessing() {
        match resolve("milk", &candidates(), &[]) {
            Resolution::Ambiguous(options) => assert_eq!(options.len(), 2),
            other => panic!("expected ambiguity, got {other:?}"),
        }
        let lunches = vec![Candidate::new("a", "Lunch with Bob"), Candidate::new("b", "Lunch with Sarah")];
        assert!(matches!(resolve("lunch", &lunches, &[]), Resolution::Ambiguous(_)));
        assert_eq!(
            resolve("eggs", &candidates(), &[]),
            Resolution::Found(Candidate::new("2", "Buy milk and eggs"))
        );
    }

    #[test]
    fn test_titles_inside_input_need_one_covering_match() {
        assert_eq!(
            resolve("done with buy milk and eggs today", &candidates(), &[]),
            Resolution::Found(Candidate::new("2", "Buy milk and eggs"))
        );
        assert!(matches!(
            resolve("call mom then buy milk", &candidates(), &[]),
            Resolution::Ambiguous(_)
        ));
    }

    #[test]
    fn test_equal_partial_matches_are_ambiguous() {
        match resolve("call", &candidates(), &[]) {
            Resolution::Ambiguous(options) => assert_eq!(options.len(), 2),
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn test_recent_refs_break_ties() {
        assert_eq!(
            resolve("call", &candidates(), &[recent("4")]),
            Resolution::Found(Candidate::new("4", "Call dad"))
        );
    }

    #[test]
    fn test_pronoun_uses_most_recent() {
        assert_eq!(
            resolve("it", &candidates(), &[recent("3"), recent("1")]),
            Resolution::Found(Candidate::new("3", "Call mom"))
        );
        assert_eq!(resolve("it", &candidates(), &[]), Resolution::NotFound);
    }

    #[test]
    fn test_reverse_containment_and_typos() {
        assert_eq!(
            resolve("please mark call mom as done", &candidates(), &[]),
            Resolution::Found(Candidate::new("3", "Call mom"))
        );
        assert_eq!(
            resolve("submit q3 finacial report", &candidates(), &[]),
            Resolution::Found(Candidate::new("5", "Submit Q3 Financial Report"))
        );
        assert_eq!(resolve("walk the dog", &candidates(), &[]), Resolution::NotFound);
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity("abc", "ABC"), 1.0);
        assert_eq!(similarity("", "abc"), 0.0);
        assert!(similarity("milk", "mlik") > 0.99);
    }
}
