//! CFI Comparison and Ordering
//!
//! Reading order: spine item first, then the element path inside the content
//! document, then the character offset. Assertions never affect ordering.

use std::cmp::Ordering;

use super::types::*;

impl Ord for Cfi {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_steps(&self.steps, &other.steps)
            .then_with(|| match (&self.offset, &other.offset) {
                (Some(a), Some(b)) => a.offset.cmp(&b.offset),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            })
    }
}

impl PartialOrd for Cfi {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Cfi {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Cfi {}

fn compare_step(a: &CfiStep, b: &CfiStep) -> Ordering {
    match (a.kind, b.kind) {
        (StepKind::Indirection, StepKind::Indirection) => Ordering::Equal,
        (StepKind::Element(a), StepKind::Element(b)) => a.cmp(&b),
        // Indirection sorts before any sibling element step
        (StepKind::Indirection, StepKind::Element(_)) => Ordering::Less,
        (StepKind::Element(_), StepKind::Indirection) => Ordering::Greater,
    }
}

fn compare_steps(a: &[CfiStep], b: &[CfiStep]) -> Ordering {
    a.iter()
        .zip(b.iter())
        .map(|(step_a, step_b)| compare_step(step_a, step_b))
        .find(|ord| *ord != Ordering::Equal)
        // A path that is a prefix of another comes first
        .unwrap_or_else(|| a.len().cmp(&b.len()))
}
