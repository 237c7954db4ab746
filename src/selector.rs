use candle_core::Var;
use regex::Regex;

use crate::{dist::ProcessGroup, TrainError};

/// Compute one trainable flag per parameter. An empty pattern trains
/// everything; otherwise a parameter trains when the regex matches anywhere
/// in its name.
pub fn trainable_flags(names: &[String], pattern: &str) -> Result<Vec<bool>, TrainError> {
    if pattern.is_empty() {
        return Ok(vec![true; names.len()]);
    }
    let regex = Regex::new(pattern)
        .map_err(|err| TrainError::config(format!("invalid variable pattern: {}", err)))?;
    Ok(names.iter().map(|name| regex.is_match(name)).collect())
}

/// Keep only the entries whose flag is set. The flag vector must have been
/// computed from the same parameter list; any length drift means the model
/// changed underneath us and training must stop.
pub fn apply_flags<G, V>(flags: &[bool], pairs: Vec<(G, V)>) -> Result<Vec<(G, V)>, TrainError> {
    if flags.len() != pairs.len() {
        return Err(TrainError::consistency(format!(
            "variable flags were computed for {} parameters but the model now has {}",
            flags.len(),
            pairs.len()
        )));
    }
    Ok(pairs
        .into_iter()
        .zip(flags)
        .filter_map(|(pair, keep)| keep.then_some(pair))
        .collect())
}

/// Log the trainable/frozen split and total trainable element count,
/// coordinator replica only.
pub fn describe_variables(group: &ProcessGroup, params: &[(String, Var)], flags: &[bool]) {
    if !group.is_coordinator() {
        return;
    }
    let mut trainable_elems = 0usize;
    for ((name, var), flag) in params.iter().zip(flags) {
        if *flag {
            trainable_elems += var.as_tensor().elem_count();
            println!("trainable variable: {}", name);
        } else {
            println!("frozen variable:    {}", name);
        }
    }
    println!("total trainable parameters: {}", trainable_elems);
}
