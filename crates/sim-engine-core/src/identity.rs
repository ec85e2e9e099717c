//! Deterministic agent identity. Codenames are assigned once at seed time
//! and never change for the lifetime of an agent number — see spec.md §4.9.

use std::collections::HashSet;

pub const IMMUTABLE_AGENT_CODENAMES: &[&str] = &[
    "Tensor", "Vector", "Matrix", "Kernel", "Lambda", "Sigma", "Delta", "Axiom", "Cipher",
    "Syntax", "Node", "Orbit", "Helix", "Quanta", "Vertex", "Circuit", "Pixel", "Fractal",
    "Scalar", "Nexus", "Logic", "Nova", "Flux", "Prime", "Arc", "Prism", "Lattice", "Beacon",
    "Proto", "Chronon", "Relay", "Specter", "Glyph", "Synth", "Tempo", "Channel", "Segment",
    "Pivot", "Meridian", "Cascade", "Lumen", "Paradox", "Eigen", "Spectra", "Contour", "Monad",
    "Aegis", "Entropy", "Atlas", "Apex",
];

fn safe_agent_number(agent_number: i64) -> i64 {
    agent_number.max(1)
}

/// Deterministic immutable codename for a canonical agent number, e.g. `Tensor-01`.
pub fn immutable_alias_for_agent_number(agent_number: i64) -> String {
    let number = safe_agent_number(agent_number);
    let len = IMMUTABLE_AGENT_CODENAMES.len() as i64;
    let codename = IMMUTABLE_AGENT_CODENAMES[((number - 1) % len) as usize];
    format!("{codename}-{number:02}")
}

pub fn aliases_unique_for_numbers(agent_numbers: impl IntoIterator<Item = i64>) -> bool {
    let numbers: Vec<i64> = agent_numbers.into_iter().collect();
    let aliases: HashSet<String> = numbers
        .iter()
        .copied()
        .map(immutable_alias_for_agent_number)
        .collect();
    aliases.len() == numbers.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_is_deterministic_and_padded() {
        assert_eq!(immutable_alias_for_agent_number(1), "Tensor-01");
        assert_eq!(immutable_alias_for_agent_number(51), "Tensor-51");
    }

    #[test]
    fn aliases_unique_across_first_cycle() {
        assert!(aliases_unique_for_numbers(1..=50));
    }

    #[test]
    fn non_positive_numbers_clamp_to_one() {
        assert_eq!(
            immutable_alias_for_agent_number(0),
            immutable_alias_for_agent_number(1)
        );
        assert_eq!(
            immutable_alias_for_agent_number(-5),
            immutable_alias_for_agent_number(1)
        );
    }
}
