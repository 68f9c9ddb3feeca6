//! Locator
//!
//! Maps addresses (EPUB CFIs) to a fractional progress value and back, and
//! orders addresses within a book. Every spine section carries a weight equal
//! to its text length, so a fraction is the share of the book's text that lies
//! before a position. Inside a section the element path of an address is
//! walked through the section's text map, so fractions rise and fall with
//! address order.
//!
//! Nothing here performs I/O; all functions are deterministic for a given
//! `BookStructure`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::cfi::{self, section_text_cfi, Cfi, StepKind};
use crate::container::BookStructure;
use crate::error::{EngineError, Result};

/// A reading position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// Advisory progress in `[0, 1]`
    pub fraction: f64,
    /// EPUB CFI
    pub address: String,
    /// Structural version the address was produced against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure_version: Option<String>,
}

impl Position {
    /// Position at an address, with the fraction computed against `structure`
    pub fn at_address(address: &str, structure: &BookStructure) -> Result<Self> {
        let fraction = address_to_fraction(address, structure)?;
        Ok(Self {
            fraction,
            address: address.to_string(),
            structure_version: Some(structure.version().to_string()),
        })
    }

    /// Nearest valid position for a fraction
    pub fn at_fraction(fraction: f64, structure: &BookStructure) -> Self {
        let fraction = clamp_fraction(fraction);
        Self {
            fraction,
            address: fraction_to_address(fraction, structure),
            structure_version: Some(structure.version().to_string()),
        }
    }

    /// Start of the book
    pub fn start(structure: &BookStructure) -> Self {
        Self::at_fraction(0.0, structure)
    }
}

/// How a stored position was mapped onto the open book
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PositionResolution {
    /// The stored address was valid for this structure
    Exact,
    /// The address came from another structural version; the fraction was used
    Remapped { previous_version: String },
    /// The address did not resolve; the fraction was used
    Degraded { reason: String },
    /// Nothing was stored; reading starts at the beginning
    Fresh,
}

fn clamp_fraction(fraction: f64) -> f64 {
    if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    }
}

/// Parse an address and check it belongs to `structure`. Returns the spine index.
fn resolve(address: &str, structure: &BookStructure) -> Result<(Cfi, usize)> {
    let parsed =
        cfi::parse(address).map_err(|e| EngineError::invalid_address(address, e.to_string()))?;

    let index = parsed.spine_index().ok_or_else(|| {
        EngineError::invalid_address(address, "does not start at the package spine")
    })?;

    let section = structure.section(index).ok_or_else(|| {
        EngineError::invalid_address(
            address,
            format!(
                "spine index {} outside {} sections",
                index,
                structure.sections().len()
            ),
        )
    })?;

    if let Some(idref) = parsed.spine_idref() {
        if idref != section.idref {
            return Err(EngineError::invalid_address(
                address,
                format!("id assertion {} does not match spine item {}", idref, section.idref),
            ));
        }
    }

    Ok((parsed, index))
}

/// Steps after the indirection into the content document. `None` when the
/// path goes on inside the package document, which orders after every point
/// of the content document.
fn document_path(cfi: &Cfi) -> Option<Vec<u32>> {
    // resolve() has checked the first two steps select the spine item
    let mut rest = cfi.steps.iter().skip(2);
    match rest.next() {
        None => Some(Vec::new()),
        Some(step) if step.kind == StepKind::Indirection => Some(
            rest.map_while(|step| match step.kind {
                StepKind::Element(n) => Some(n),
                StepKind::Indirection => None,
            })
            .collect(),
        ),
        Some(_) => None,
    }
}

/// Fraction of the book that lies before `address`
pub fn address_to_fraction(address: &str, structure: &BookStructure) -> Result<f64> {
    let (parsed, index) = resolve(address, structure)?;

    // resolve() guarantees the index is in range
    let start = structure.weight_before(index).unwrap_or(0);
    let weight = structure.section_weight(index).unwrap_or(1);
    let offset = match (document_path(&parsed), structure.text_map(index)) {
        (Some(path), Some(text)) => {
            u64::from(text.offset_of(&path, parsed.character_offset())).min(weight)
        }
        (Some(_), None) => 0,
        (None, _) => weight,
    };

    let total = structure.total_weight().max(1);
    Ok(((start + offset) as f64 / total as f64).clamp(0.0, 1.0))
}

/// Nearest valid address for a fraction. Never fails: out-of-range and NaN
/// input is clamped into `[0, 1]`.
pub fn fraction_to_address(fraction: f64, structure: &BookStructure) -> String {
    let sections = structure.sections();
    if sections.is_empty() {
        return section_text_cfi(0, "", &[], 0).to_string();
    }

    let target = clamp_fraction(fraction) * structure.total_weight() as f64;

    // Last section whose start is at or before the target
    let index = (0..sections.len())
        .rev()
        .find(|&i| structure.weight_before(i).unwrap_or(0) as f64 <= target)
        .unwrap_or(0);

    let section = &sections[index];
    let start = structure.weight_before(index).unwrap_or(0) as f64;
    let weight = structure.section_weight(index).unwrap_or(1);

    let offset = if index == sections.len() - 1 && target >= structure.total_weight() as f64 {
        weight
    } else {
        ((target - start).round().max(0.0) as u64).min(weight)
    };

    let cfi = match structure
        .text_map(index)
        .and_then(|text| text.locate(offset as u32))
    {
        Some((path, within)) => section_text_cfi(index, &section.idref, path, within),
        // No text at all: point at the start of the body
        None => section_text_cfi(index, &section.idref, &[], 0),
    };
    cfi.to_string()
}

/// Total order of two addresses in `structure`: spine order, then element
/// path, then character offset.
pub fn compare(a: &str, b: &str, structure: &BookStructure) -> Result<Ordering> {
    let (a, _) = resolve(a, structure)?;
    let (b, _) = resolve(b, structure)?;
    Ok(a.cmp(&b))
}

/// Order two positions without a structure at hand. Addresses from the same
/// structural version compare by CFI; anything else falls back to fractions.
pub fn order_positions(a: &Position, b: &Position) -> Ordering {
    let parsed = (cfi::parse(&a.address), cfi::parse(&b.address));

    let same_version = match (&a.structure_version, &b.structure_version) {
        (Some(x), Some(y)) => x == y,
        (None, None) => true,
        _ => false,
    };

    if same_version {
        if let (Ok(x), Ok(y)) = &parsed {
            return x.cmp(y);
        }
    }

    let by_fraction = a
        .fraction
        .partial_cmp(&b.fraction)
        .unwrap_or(Ordering::Equal);

    match (by_fraction, parsed) {
        (Ordering::Equal, (Ok(x), Ok(y))) => x.cmp(&y),
        (ordering, _) => ordering,
    }
}

/// Map a stored position onto `structure`. Stale addresses fall back to the
/// stored fraction.
pub fn resolve_position(
    stored: Option<&Position>,
    structure: &BookStructure,
) -> (Position, PositionResolution) {
    let Some(stored) = stored else {
        return (Position::start(structure), PositionResolution::Fresh);
    };

    if let Some(previous) = &stored.structure_version {
        if previous != structure.version() {
            tracing::warn!(
                previous = %previous,
                current = %structure.version(),
                "position from another structural version, using fraction"
            );
            return (
                Position::at_fraction(stored.fraction, structure),
                PositionResolution::Remapped {
                    previous_version: previous.clone(),
                },
            );
        }
    }

    match Position::at_address(&stored.address, structure) {
        Ok(position) => (position, PositionResolution::Exact),
        Err(e) => {
            tracing::warn!(address = %stored.address, "stored address unusable: {}", e);
            (
                Position::at_fraction(stored.fraction, structure),
                PositionResolution::Degraded {
                    reason: e.to_string(),
                },
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{SpineSection, TextMap};

    fn structure(weights: &[u32]) -> BookStructure {
        let sections = weights
            .iter()
            .enumerate()
            .map(|(index, &weight)| SpineSection {
                index,
                idref: format!("ch{}", index + 1),
                href: format!("OEBPS/ch{}.xhtml", index + 1),
                media_type: "application/xhtml+xml".to_string(),
                linear: true,
                weight,
            })
            .collect();
        BookStructure::new(sections, Vec::new())
    }

    #[test]
    fn test_address_to_fraction() {
        let s = structure(&[100, 200, 100]);

        assert_eq!(address_to_fraction("epubcfi(/6/2[ch1]!/4/1:0)", &s).unwrap(), 0.0);
        assert_eq!(address_to_fraction("epubcfi(/6/4[ch2]!/4/1:0)", &s).unwrap(), 0.25);
        assert_eq!(address_to_fraction("epubcfi(/6/4[ch2]!/4/1:100)", &s).unwrap(), 0.5);
        // Without a text layout, paths past the single body run sit at its end
        assert_eq!(address_to_fraction("epubcfi(/6/6!/4/10/3:50)", &s).unwrap(), 1.0);
        assert_eq!(address_to_fraction("epubcfi(/6/4)", &s).unwrap(), 0.25);
        // Offsets past the end of the section clamp to it
        assert_eq!(address_to_fraction("epubcfi(/6/6[ch3]!/4/1:5000)", &s).unwrap(), 1.0);
    }

    fn paragraphs(lens: &[u32]) -> TextMap {
        let mut text = TextMap::default();
        for (i, &len) in lens.iter().enumerate() {
            text.push(vec![4, (i as u32 + 1) * 2, 1], len);
        }
        text
    }

    #[test]
    fn test_address_to_fraction_walks_text_map() {
        let sections = structure(&[100, 200, 100]).sections().to_vec();
        let s = BookStructure::with_text(
            sections,
            Vec::new(),
            vec![paragraphs(&[100]), paragraphs(&[50, 150]), paragraphs(&[100])],
        );

        assert_eq!(address_to_fraction("epubcfi(/6/4[ch2]!/4/2/1:50)", &s).unwrap(), 0.375);
        assert_eq!(address_to_fraction("epubcfi(/6/4[ch2]!/4/4/1:10)", &s).unwrap(), 0.4);
        // Past the last paragraph
        assert_eq!(address_to_fraction("epubcfi(/6/4[ch2]!/4/40/1:0)", &s).unwrap(), 0.75);

        assert_eq!(fraction_to_address(0.4, &s), "epubcfi(/6/4[ch2]!/4/4/1:10)");
        assert_eq!(fraction_to_address(1.0, &s), "epubcfi(/6/6[ch3]!/4/2/1:100)");
    }

    #[test]
    fn test_fraction_follows_address_order() {
        let flat = structure(&[100, 200, 100]);
        let nested = BookStructure::with_text(
            flat.sections().to_vec(),
            Vec::new(),
            vec![paragraphs(&[100]), paragraphs(&[20, 30, 150]), paragraphs(&[60, 40])],
        );

        for s in [&flat, &nested] {
            let mut addresses: Vec<String> = [
                "epubcfi(/6/4[ch2]!/4/2/1:50)",
                "epubcfi(/6/4[ch2]!/4/40/1:0)",
                "epubcfi(/6/4[ch2]!/4/1:150)",
                "epubcfi(/6/4[ch2]!/4/4)",
                "epubcfi(/6/4[ch2]!/4/6/1:3)",
                "epubcfi(/6/4[ch2]!/4/6/1:999)",
                "epubcfi(/6/2!/4/2/1:5)",
                "epubcfi(/6/6!/4/3:2)",
                "epubcfi(/6/4)",
                "epubcfi(/6/4/2)",
            ]
            .iter()
            .map(|a| a.to_string())
            .collect();
            addresses.extend((0..=20).map(|i| fraction_to_address(i as f64 / 20.0, s)));

            addresses.sort_by(|a, b| compare(a, b, s).unwrap());
            for pair in addresses.windows(2) {
                let fa = address_to_fraction(&pair[0], s).unwrap();
                let fb = address_to_fraction(&pair[1], s).unwrap();
                assert!(fa <= fb, "{} ({}) before {} ({})", pair[0], fa, pair[1], fb);
            }
        }
    }

    #[test]
    fn test_invalid_addresses() {
        let s = structure(&[100, 200, 100]);

        for address in [
            "not a cfi",
            "epubcfi(/4/2!/4/1:0)",
            "epubcfi(/6/8!/4/1:0)",
            "epubcfi(/6/2[wrong]!/4/1:0)",
        ] {
            assert!(
                matches!(
                    address_to_fraction(address, &s),
                    Err(EngineError::InvalidAddress { .. })
                ),
                "{} should be invalid",
                address
            );
        }
    }

    #[test]
    fn test_fraction_to_address() {
        let s = structure(&[100, 200, 100]);

        assert_eq!(fraction_to_address(0.0, &s), "epubcfi(/6/2[ch1]!/4/1:0)");
        assert_eq!(fraction_to_address(0.5, &s), "epubcfi(/6/4[ch2]!/4/1:100)");
        assert_eq!(fraction_to_address(1.0, &s), "epubcfi(/6/6[ch3]!/4/1:100)");
    }

    #[test]
    fn test_fraction_is_clamped() {
        let s = structure(&[100, 200, 100]);

        assert_eq!(fraction_to_address(-3.0, &s), fraction_to_address(0.0, &s));
        assert_eq!(fraction_to_address(7.5, &s), fraction_to_address(1.0, &s));
        assert_eq!(fraction_to_address(f64::NAN, &s), fraction_to_address(0.0, &s));
    }

    #[test]
    fn test_round_trip_within_tolerance() {
        let s = structure(&[137, 1, 2048, 0, 311]);
        let tolerance = 0.5 / s.total_weight() as f64 + 1e-9;

        for step in 0..=1000 {
            let fraction = step as f64 / 1000.0;
            let address = fraction_to_address(fraction, &s);
            let back = address_to_fraction(&address, &s).unwrap();
            assert!(
                (back - fraction).abs() <= tolerance,
                "fraction {} came back as {} via {}",
                fraction,
                back,
                address
            );
        }
    }

    #[test]
    fn test_compare_total_order() {
        let s = structure(&[100, 200, 100]);
        let mut addresses: Vec<String> = (0..=40)
            .rev()
            .map(|i| fraction_to_address(i as f64 / 40.0, &s))
            .collect();

        addresses.sort_by(|a, b| compare(a, b, &s).unwrap());

        for pair in addresses.windows(2) {
            let ordering = compare(&pair[0], &pair[1], &s).unwrap();
            assert_eq!(ordering, Ordering::Less, "{} vs {}", pair[0], pair[1]);
            assert_eq!(compare(&pair[1], &pair[0], &s).unwrap(), Ordering::Greater);
            let fa = address_to_fraction(&pair[0], &s).unwrap();
            let fb = address_to_fraction(&pair[1], &s).unwrap();
            assert!(fa <= fb);
        }

        assert_eq!(
            compare("epubcfi(/6/4!/4/1:3)", "epubcfi(/6/4[ch2]!/4/1:3)", &s).unwrap(),
            Ordering::Equal
        );
        assert!(compare("epubcfi(/6/40!/4/1:3)", "epubcfi(/6/4!/4/1:3)", &s).is_err());
    }

    #[test]
    fn test_order_positions() {
        let s = structure(&[100, 200, 100]);
        let early = Position::at_fraction(0.2, &s);
        let late = Position::at_fraction(0.7, &s);

        assert_eq!(order_positions(&early, &late), Ordering::Less);
        assert_eq!(order_positions(&late, &early), Ordering::Greater);
        assert_eq!(order_positions(&late, &late.clone()), Ordering::Equal);

        // Different versions compare by fraction
        let foreign = Position {
            fraction: 0.9,
            address: "epubcfi(/6/2!/4/1:0)".to_string(),
            structure_version: Some("0000000000000000".to_string()),
        };
        assert_eq!(order_positions(&late, &foreign), Ordering::Less);
    }

    #[test]
    fn test_resolve_position() {
        let s = structure(&[100, 200, 100]);

        let (position, resolution) = resolve_position(None, &s);
        assert_eq!(resolution, PositionResolution::Fresh);
        assert_eq!(position.fraction, 0.0);

        let stored = Position::at_fraction(0.42, &s);
        let (position, resolution) = resolve_position(Some(&stored), &s);
        assert_eq!(resolution, PositionResolution::Exact);
        assert_eq!(position.address, stored.address);

        let stale = Position {
            fraction: 0.5,
            address: "epubcfi(/6/20[gone]!/4/1:0)".to_string(),
            structure_version: Some(s.version().to_string()),
        };
        let (position, resolution) = resolve_position(Some(&stale), &s);
        assert!(matches!(resolution, PositionResolution::Degraded { .. }));
        assert_eq!(position.address, fraction_to_address(0.5, &s));

        let republished = structure(&[100, 250, 100]);
        let (position, resolution) = resolve_position(Some(&stored), &republished);
        assert_eq!(
            resolution,
            PositionResolution::Remapped {
                previous_version: s.version().to_string()
            }
        );
        assert_eq!(position.structure_version.as_deref(), Some(republished.version()));
    }
}
