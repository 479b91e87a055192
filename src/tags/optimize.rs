//! Simplification of filter trees.
//!
//! `optimize_and` and `optimize_or` recurse through the tree once, then hand
//! the optimized terms to `simplify_and` / `simplify_or`, which call each other
//! when common conjuncts are factored out. Every rewrite is
//! semantics-preserving; the ones that reason about implication go through
//! [`implies`], which is sound but incomplete.
//!
//! Termination: each node runs at most `MAX_OPTIMIZE_PASSES` local passes and a
//! pass that changes nothing ends the loop. Factoring common conjuncts out of
//! an `or` recurses into a strictly smaller sub-expression and is cut off at
//! `MAX_OPTIMIZE_DEPTH`, past which the `or` is left unfactored.

use std::collections::BTreeMap;

use super::{Matcher, Optimized, Properties, RegexTag, TagsFilter};

pub const MAX_OPTIMIZE_PASSES: usize = 32;
pub const MAX_OPTIMIZE_DEPTH: usize = 24;

pub(crate) fn optimize(filter: &TagsFilter) -> Optimized {
    let mut current = optimize_node(filter);
    for _ in 0..MAX_OPTIMIZE_PASSES {
        let Optimized::Filter(f) = &current else {
            break;
        };
        let next = optimize_node(f);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn optimize_node(filter: &TagsFilter) -> Optimized {
    match filter {
        TagsFilter::Tag(_) | TagsFilter::Substituting(_) | TagsFilter::Comparing(_) => {
            Optimized::Filter(filter.clone())
        }
        TagsFilter::Regex(tag) => optimize_regex(tag),
        TagsFilter::And(children) => optimize_and(children),
        TagsFilter::Or(children) => optimize_or(children),
    }
}

fn optimize_regex(tag: &RegexTag) -> Optimized {
    if let (Matcher::Exact(_), Matcher::Pattern(p)) = (&tag.key, &tag.value)
        && p.source() == ".*"
    {
        return Optimized::from_bool(!tag.invert);
    }
    Optimized::Filter(tag.simplified())
}

fn optimize_and(children: &[TagsFilter]) -> Optimized {
    let mut terms = Vec::with_capacity(children.len());
    for child in children {
        match optimize_node(child) {
            Optimized::True => {}
            Optimized::False => return Optimized::False,
            Optimized::Filter(f) => terms.push(f),
        }
    }
    simplify_and(terms)
}

fn optimize_or(children: &[TagsFilter]) -> Optimized {
    let mut terms = Vec::with_capacity(children.len());
    for child in children {
        match optimize_node(child) {
            Optimized::True => return Optimized::True,
            Optimized::False => {}
            Optimized::Filter(f) => terms.push(f),
        }
    }
    simplify_or(terms, 0)
}

/// Simplify a conjunction whose terms are already optimized. Terms are never
/// optimized again here, so the cost stays proportional to the term list.
fn simplify_and(terms: Vec<TagsFilter>) -> Optimized {
    let mut terms = flatten(terms, |t| matches!(t, TagsFilter::And(_)));

    for _ in 0..MAX_OPTIMIZE_PASSES {
        let before = terms.clone();
        dedup(&mut terms);

        // Exact tags fix the value of their key for every other conjunct.
        let Some(known) = known_assignment(&terms) else {
            return Optimized::False;
        };
        let mut next = Vec::with_capacity(terms.len());
        for term in terms {
            if matches!(term, TagsFilter::Tag(_)) {
                next.push(term);
                continue;
            }
            match assume(&term, &known) {
                Optimized::True => {}
                Optimized::False => return Optimized::False,
                Optimized::Filter(f) => next.push(f),
            }
        }
        terms = flatten(next, |t| matches!(t, TagsFilter::And(_)));
        dedup(&mut terms);

        // a & b where a => b is just a
        remove_redundant(&mut terms, |candidate, other| implies(other, candidate));

        if has_contradiction(&terms) {
            return Optimized::False;
        }

        sort_terms(&mut terms);
        if terms == before {
            break;
        }
    }

    match terms.len() {
        0 => Optimized::True,
        1 => Optimized::Filter(terms.remove(0)),
        _ => Optimized::Filter(TagsFilter::And(terms)),
    }
}

/// Simplify a disjunction whose terms are already optimized.
fn simplify_or(terms: Vec<TagsFilter>, depth: usize) -> Optimized {
    let mut terms = flatten(terms, |t| matches!(t, TagsFilter::Or(_)));

    for _ in 0..MAX_OPTIMIZE_PASSES {
        let before = terms.clone();
        dedup(&mut terms);

        // a | b where a => b is just b
        remove_redundant(&mut terms, |candidate, other| implies(candidate, other));

        // Inside an and-branch every plain term may be assumed false.
        match prune_known_false(terms) {
            Some(pruned) => terms = pruned,
            None => return Optimized::True,
        }

        if is_tautology(&terms) {
            return Optimized::True;
        }

        if depth < MAX_OPTIMIZE_DEPTH
            && let Some(Factored {
                plain,
                common,
                rests,
            }) = factor_common_conjuncts(&terms)
        {
            terms = plain;
            match factored_and(common, rests, depth + 1) {
                Optimized::True => return Optimized::True,
                Optimized::False => {}
                Optimized::Filter(TagsFilter::Or(inner)) => terms.extend(inner),
                Optimized::Filter(f) => terms.push(f),
            }
            dedup(&mut terms);
        }

        sort_terms(&mut terms);
        if terms == before {
            break;
        }
    }

    match terms.len() {
        0 => Optimized::False,
        1 => Optimized::Filter(terms.remove(0)),
        _ => Optimized::Filter(TagsFilter::Or(terms)),
    }
}

/// `common & (rest_1 | rest_2 | ...)`, each part simplified once.
fn factored_and(common: Vec<TagsFilter>, rests: Vec<Vec<TagsFilter>>, depth: usize) -> Optimized {
    let mut alternatives = Vec::with_capacity(rests.len());
    let mut any_true = false;
    for rest in rests {
        match simplify_and(rest) {
            Optimized::True => any_true = true,
            Optimized::False => {}
            Optimized::Filter(f) => alternatives.push(f),
        }
    }
    let mut conjuncts = common;
    if !any_true {
        match simplify_or(alternatives, depth) {
            Optimized::True => {}
            Optimized::False => return Optimized::False,
            Optimized::Filter(f) => conjuncts.push(f),
        }
    }
    simplify_and(conjuncts)
}

fn flatten(terms: Vec<TagsFilter>, same_kind: impl Fn(&TagsFilter) -> bool) -> Vec<TagsFilter> {
    let mut out = Vec::with_capacity(terms.len());
    for term in terms {
        if !same_kind(&term) {
            out.push(term);
        } else if let TagsFilter::And(inner) | TagsFilter::Or(inner) = term {
            out.extend(inner);
        }
    }
    out
}

/// Drop conjuncts of and-branches that follow from the negation of a plain
/// sibling term. Returns `None` when an and-branch dissolves completely, which
/// makes the whole `or` true.
fn prune_known_false(terms: Vec<TagsFilter>) -> Option<Vec<TagsFilter>> {
    let negations: Vec<TagsFilter> = terms
        .iter()
        .filter(|t| !matches!(t, TagsFilter::And(_)))
        .filter_map(super::negate_leaf)
        .collect();
    if negations.is_empty() {
        return Some(terms);
    }

    let mut out = Vec::with_capacity(terms.len());
    for term in terms {
        let TagsFilter::And(conjuncts) = term else {
            out.push(term);
            continue;
        };
        let mut kept: Vec<TagsFilter> = conjuncts
            .into_iter()
            .filter(|c| !negations.iter().any(|n| implies(n, c)))
            .collect();
        match kept.len() {
            0 => return None,
            1 => match kept.remove(0) {
                TagsFilter::Or(inner) => out.extend(inner),
                single => out.push(single),
            },
            _ => out.push(TagsFilter::And(kept)),
        }
    }
    Some(out)
}

struct Factored {
    plain: Vec<TagsFilter>,
    common: Vec<TagsFilter>,
    rests: Vec<Vec<TagsFilter>>,
}

/// `(A&B) | (A&C) | P` becomes `P | (A & (B|C))`.
fn factor_common_conjuncts(terms: &[TagsFilter]) -> Option<Factored> {
    let and_terms: Vec<&Vec<TagsFilter>> = terms
        .iter()
        .filter_map(|t| match t {
            TagsFilter::And(conjuncts) => Some(conjuncts),
            _ => None,
        })
        .collect();
    if and_terms.len() < 2 {
        return None;
    }

    let common: Vec<TagsFilter> = and_terms[0]
        .iter()
        .filter(|c| and_terms[1..].iter().all(|other| other.contains(c)))
        .cloned()
        .collect();
    if common.is_empty() {
        return None;
    }

    let rests = and_terms
        .iter()
        .map(|conjuncts| {
            conjuncts
                .iter()
                .filter(|c| !common.contains(c))
                .cloned()
                .collect()
        })
        .collect();
    let plain = terms
        .iter()
        .filter(|t| !matches!(t, TagsFilter::And(_)))
        .cloned()
        .collect();
    Some(Factored {
        plain,
        common,
        rests,
    })
}

/// `a | b` where `not a` implies `b`.
fn is_tautology(terms: &[TagsFilter]) -> bool {
    terms.iter().enumerate().any(|(i, a)| {
        super::negate_leaf(a).is_some_and(|not_a| {
            terms
                .iter()
                .enumerate()
                .any(|(j, b)| i != j && implies(&not_a, b))
        })
    })
}

/// `a & b` where `a` implies `not b`.
fn has_contradiction(terms: &[TagsFilter]) -> bool {
    terms.iter().enumerate().any(|(j, b)| {
        super::negate_leaf(b).is_some_and(|not_b| {
            terms
                .iter()
                .enumerate()
                .any(|(i, a)| i != j && implies(a, &not_b))
        })
    })
}

/// Values fixed by exact tags; `None` when two tags disagree on a key.
fn known_assignment(terms: &[TagsFilter]) -> Option<BTreeMap<String, String>> {
    let mut known = BTreeMap::new();
    for term in terms {
        if let TagsFilter::Tag(tag) = term
            && let Some(previous) = known.insert(tag.key.clone(), tag.value.clone())
            && previous != tag.value
        {
            return None;
        }
    }
    Some(known)
}

/// Partially evaluate `filter` under the assumption that the keys in `known`
/// have exactly the given values (empty = absent).
fn assume(filter: &TagsFilter, known: &BTreeMap<String, String>) -> Optimized {
    match filter {
        TagsFilter::And(children) => {
            let mut kept = Vec::new();
            for child in children {
                match assume(child, known) {
                    Optimized::True => {}
                    Optimized::False => return Optimized::False,
                    Optimized::Filter(f) => kept.push(f),
                }
            }
            match kept.len() {
                0 => Optimized::True,
                1 => Optimized::Filter(kept.remove(0)),
                _ => Optimized::Filter(TagsFilter::And(kept)),
            }
        }
        TagsFilter::Or(children) => {
            let mut kept = Vec::new();
            for child in children {
                match assume(child, known) {
                    Optimized::True => return Optimized::True,
                    Optimized::False => {}
                    Optimized::Filter(f) => kept.push(f),
                }
            }
            match kept.len() {
                0 => Optimized::False,
                1 => Optimized::Filter(kept.remove(0)),
                _ => Optimized::Filter(TagsFilter::Or(kept)),
            }
        }
        leaf => match single_key(leaf).and_then(|k| known.get(k).map(|v| (k, v))) {
            Some((key, value)) => {
                let mut properties = Properties::new();
                if !value.is_empty() {
                    properties.insert(key.to_string(), value.clone());
                }
                Optimized::from_bool(leaf.matches_properties(&properties))
            }
            None => Optimized::Filter(leaf.clone()),
        },
    }
}

/// The only key a leaf depends on.
fn single_key(filter: &TagsFilter) -> Option<&str> {
    match filter {
        TagsFilter::Tag(tag) => Some(&tag.key),
        TagsFilter::Regex(tag) => tag.exact_key(),
        TagsFilter::Comparing(tag) => Some(&tag.key),
        TagsFilter::Substituting(_) | TagsFilter::And(_) | TagsFilter::Or(_) => None,
    }
}

/// Sound, incomplete implication: `true` guarantees that every property set
/// matching `a` also matches `b`.
pub(crate) fn implies(a: &TagsFilter, b: &TagsFilter) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (_, TagsFilter::And(bs)) => bs.iter().all(|c| implies(a, c)),
        (TagsFilter::Or(as_), _) => as_.iter().all(|c| implies(c, b)),
        (TagsFilter::And(as_), _) => as_.iter().any(|c| implies(c, b)),
        (_, TagsFilter::Or(bs)) => bs.iter().any(|c| implies(a, c)),
        _ => leaf_implies(a, b),
    }
}

fn leaf_implies(a: &TagsFilter, b: &TagsFilter) -> bool {
    // A literal value for the key decides every other test of that key.
    let fixed = match a {
        TagsFilter::Tag(tag) => Some((tag.key.as_str(), tag.value.as_str())),
        TagsFilter::Regex(RegexTag {
            key: Matcher::Exact(key),
            value: Matcher::Exact(value),
            invert: false,
        }) => Some((key.as_str(), value.as_str())),
        _ => None,
    };
    if let Some((key, value)) = fixed {
        if single_key(b) != Some(key) {
            return false;
        }
        let mut properties = Properties::new();
        if !value.is_empty() {
            properties.insert(key.to_string(), value.to_string());
        }
        return b.matches_properties(&properties);
    }

    match (a, b) {
        (TagsFilter::Regex(ra), TagsFilter::Regex(rb)) => {
            ra.exact_key().is_some()
                && ra.exact_key() == rb.exact_key()
                && !ra.invert
                && !ra.value.matches("")
                && is_presence(rb)
        }
        (TagsFilter::Comparing(ca), TagsFilter::Comparing(cb)) => ca.implies(cb),
        (TagsFilter::Comparing(ca), TagsFilter::Regex(rb)) => {
            rb.exact_key() == Some(ca.key.as_str()) && is_presence(rb)
        }
        _ => false,
    }
}

fn is_presence(tag: &RegexTag) -> bool {
    tag.invert && tag.value == Matcher::Exact(String::new())
}

fn dedup(terms: &mut Vec<TagsFilter>) {
    let mut unique: Vec<TagsFilter> = Vec::with_capacity(terms.len());
    for term in terms.drain(..) {
        if !unique.contains(&term) {
            unique.push(term);
        }
    }
    *terms = unique;
}

/// Remove `terms[i]` when `redundant(terms[i], terms[j])` holds for another
/// kept term. Removal is sequential so of two equivalent terms one survives.
fn remove_redundant(
    terms: &mut Vec<TagsFilter>,
    redundant: impl Fn(&TagsFilter, &TagsFilter) -> bool,
) {
    let mut i = 0;
    while i < terms.len() {
        let drop = (0..terms.len()).any(|j| j != i && redundant(&terms[i], &terms[j]));
        if drop {
            terms.remove(i);
        } else {
            i += 1;
        }
    }
}

fn sort_terms(terms: &mut [TagsFilter]) {
    terms.sort_by_cached_key(|t| t.sort_key());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{CompareOp, ComparingTag, Pattern, parse_tag_string, props};
    use proptest::prelude::*;

    fn parse(s: &str) -> TagsFilter {
        parse_tag_string(s).unwrap()
    }

    fn and(children: Vec<TagsFilter>) -> TagsFilter {
        TagsFilter::And(children)
    }

    fn or(children: Vec<TagsFilter>) -> TagsFilter {
        TagsFilter::Or(children)
    }

    #[test]
    fn test_empty_and_is_true() {
        assert_eq!(and(vec![]).optimize(), Optimized::True);
    }

    #[test]
    fn test_empty_or_is_false() {
        assert_eq!(or(vec![]).optimize(), Optimized::False);
    }

    #[test]
    fn test_equal_and_not_equal_is_false() {
        let filter = and(vec![
            TagsFilter::tag("k", "v"),
            TagsFilter::Regex(RegexTag::new(
                Matcher::Exact("k".into()),
                Matcher::Exact("v".into()),
                true,
            )),
        ]);
        assert_eq!(filter.optimize(), Optimized::False);
    }

    #[test]
    fn test_conflicting_tags_are_false() {
        assert_eq!(and(vec![parse("k=a"), parse("k=b")]).optimize(), Optimized::False);
    }

    #[test]
    fn test_or_with_true_branch_is_true() {
        let filter = or(vec![parse("a=b"), and(vec![])]);
        assert_eq!(filter.optimize(), Optimized::True);
    }

    #[test]
    fn test_and_with_false_branch_is_false() {
        let filter = and(vec![parse("a=b"), or(vec![])]);
        assert_eq!(filter.optimize(), Optimized::False);
    }

    #[test]
    fn test_nested_or_is_flattened() {
        let filter = or(vec![parse("a=1"), or(vec![parse("b=2"), parse("c=3")])]);
        assert_eq!(
            filter.optimize(),
            Optimized::Filter(or(vec![parse("a=1"), parse("b=2"), parse("c=3")]))
        );
    }

    #[test]
    fn test_single_child_is_unwrapped() {
        assert_eq!(
            and(vec![or(vec![parse("a=b")])]).optimize(),
            Optimized::Filter(parse("a=b"))
        );
    }

    #[test]
    fn test_common_conjuncts_are_factored() {
        let filter = or(vec![
            and(vec![parse("amenity=bench"), parse("backrest=yes")]),
            and(vec![parse("amenity=bench"), parse("armrest=yes")]),
        ]);
        assert_eq!(
            filter.optimize(),
            Optimized::Filter(and(vec![
                parse("amenity=bench"),
                or(vec![parse("armrest=yes"), parse("backrest=yes")]),
            ]))
        );
    }

    #[test]
    fn test_known_tag_decides_sibling_or() {
        let filter = and(vec![
            parse("shop=bakery"),
            or(vec![parse("shop=bakery"), parse("craft=bakery")]),
        ]);
        assert_eq!(filter.optimize(), Optimized::Filter(parse("shop=bakery")));

        let filter = and(vec![
            parse("shop=bakery"),
            or(vec![parse("shop=butcher"), parse("craft=bakery")]),
        ]);
        assert_eq!(
            filter.optimize(),
            Optimized::Filter(and(vec![parse("craft=bakery"), parse("shop=bakery")]))
        );
    }

    #[test]
    fn test_absorption_in_or() {
        let filter = or(vec![parse("a=b"), and(vec![parse("a=b"), parse("c=d")])]);
        assert_eq!(filter.optimize(), Optimized::Filter(parse("a=b")));
    }

    #[test]
    fn test_tag_or_its_negation_is_true() {
        assert_eq!(or(vec![parse("a=b"), parse("a!=b")]).optimize(), Optimized::True);
        assert_eq!(or(vec![parse("a="), parse("a~*")]).optimize(), Optimized::True);
    }

    #[test]
    fn test_negated_plain_term_prunes_conjunct() {
        // In the second branch `fixme=` may be assumed false, so `fixme~*` holds.
        let filter = or(vec![parse("fixme="), and(vec![parse("fixme~*"), parse("a=b")])]);
        assert_eq!(
            filter.optimize(),
            Optimized::Filter(or(vec![parse("a=b"), parse("fixme=")]))
        );
    }

    #[test]
    fn test_comparisons_keep_tightest_bound() {
        let filter = and(vec![parse("lanes>2"), parse("lanes>4")]);
        assert_eq!(filter.optimize(), Optimized::Filter(parse("lanes>4")));
        let filter = or(vec![parse("lanes>2"), parse("lanes>4")]);
        assert_eq!(filter.optimize(), Optimized::Filter(parse("lanes>2")));
    }

    #[test]
    fn test_regex_match_all() {
        assert_eq!(parse("a~.*").optimize(), Optimized::True);
        assert_eq!(parse("a!~.*").optimize(), Optimized::False);
    }

    #[test]
    fn test_shadows_examples() {
        assert!(parse("a=b").shadows(&parse("a~*")));
        assert!(parse("a=b").shadows(&parse("a!=c")));
        assert!(!parse("a=b").shadows(&parse("a!=b")));
        assert!(and(vec![parse("a=b"), parse("c=d")]).shadows(&parse("c=d")));
        assert!(parse("a=b").shadows(&or(vec![parse("a=b"), parse("x=y")])));
        assert!(parse("a~x|y").shadows(&parse("a~*")));
        assert!(!parse("a~*").shadows(&parse("a=b")));
    }

    #[test]
    fn test_deep_nesting_terminates() {
        let mut filter = parse("k0=v");
        for i in 1..200 {
            let leaf = TagsFilter::tag(format!("k{}", i % 7), format!("v{}", i % 3));
            filter = if i % 2 == 0 {
                or(vec![and(vec![leaf.clone(), filter.clone()]), and(vec![leaf, parse("x=y")])])
            } else {
                and(vec![or(vec![filter, parse("z=w")]), leaf])
            };
        }
        let once = filter.optimize();
        let twice = match &once {
            Optimized::Filter(f) => f.optimize(),
            other => other.clone(),
        };
        assert_eq!(once, twice);
    }

    const KEYS: [&str; 3] = ["a", "b", "c"];
    const VALUES: [&str; 4] = ["x", "y", "1", "3"];

    fn leaf_strategy() -> impl Strategy<Value = TagsFilter> {
        let key = prop::sample::select(&KEYS[..]);
        let value = prop::sample::select(&VALUES[..]);
        prop_oneof![
            (key.clone(), value.clone()).prop_map(|(k, v)| TagsFilter::tag(k, v)),
            key.clone().prop_map(|k| TagsFilter::tag(k, "")),
            (key.clone(), value.clone(), any::<bool>()).prop_map(|(k, v, invert)| {
                TagsFilter::Regex(RegexTag::new(
                    Matcher::Exact(k.into()),
                    Matcher::Exact(v.into()),
                    invert,
                ))
            }),
            (key.clone(), any::<bool>()).prop_map(|(k, invert)| {
                TagsFilter::Regex(RegexTag::new(
                    Matcher::Exact(k.into()),
                    Matcher::Pattern(Pattern::new("x|1").unwrap()),
                    invert,
                ))
            }),
            key.clone().prop_map(|k| TagsFilter::Regex(RegexTag::present(k))),
            (key, prop::sample::select(&[CompareOp::Lt, CompareOp::Ge][..]), 0..5u8)
                .prop_map(|(k, op, n)| TagsFilter::Comparing(ComparingTag::new(k, op, n as f64))),
        ]
    }

    fn filter_strategy() -> impl Strategy<Value = TagsFilter> {
        leaf_strategy().prop_recursive(4, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(TagsFilter::And),
                prop::collection::vec(inner, 0..4).prop_map(TagsFilter::Or),
            ]
        })
    }

    fn properties_strategy() -> impl Strategy<Value = Properties> {
        prop::collection::vec(prop::option::of(prop::sample::select(&VALUES[..])), 3).prop_map(
            |values| {
                KEYS.iter()
                    .zip(values)
                    .filter_map(|(k, v)| v.map(|v| (k.to_string(), v.to_string())))
                    .collect()
            },
        )
    }

    proptest! {
        #[test]
        fn test_prop_optimize_preserves_matching(
            filter in filter_strategy(),
            samples in prop::collection::vec(properties_strategy(), 16),
        ) {
            let optimized = filter.optimize();
            for properties in &samples {
                prop_assert_eq!(
                    optimized.matches_properties(properties),
                    filter.matches_properties(properties),
                    "{} optimized to {:?} on {:?}", filter, optimized, properties
                );
            }
        }

        #[test]
        fn test_prop_optimize_is_idempotent(filter in filter_strategy()) {
            let once = filter.optimize();
            let twice = match &once {
                Optimized::Filter(f) => f.optimize(),
                other => other.clone(),
            };
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn test_prop_shadowing_is_implication(
            a in filter_strategy(),
            b in filter_strategy(),
            samples in prop::collection::vec(properties_strategy(), 16),
        ) {
            if a.shadows(&b) {
                for properties in &samples {
                    prop_assert!(!a.matches_properties(properties) || b.matches_properties(properties));
                }
            }
        }
    }

    #[test]
    fn test_empty_properties_sample() {
        let filter = or(vec![parse("a="), parse("b=x")]);
        assert!(filter.optimize().matches_properties(&props(&[])));
    }
}
