//! Built-in, code-agnostic output extractors (§4.6.6). Each takes the raw
//! text already collected from a completed job's output and returns a
//! shallow map of extracted values, or an error string that the orchestrator
//! logs as a warning without failing the node.
//!
//! Grounded in the CRYSTAL output conventions of the source TUI's
//! orchestrator: the final SCF energy line, the direct/indirect/generic band
//! gap lines, and the six-parameter cell header.

use std::collections::HashMap;

use serde_json::json;

/// Scans backwards for the last "SCF ENDED ... E(AU) = X" line and returns
/// `{final_energy: X}`. Scanning backwards picks the final SCF cycle of a
/// geometry optimization rather than an intermediate step's energy.
pub fn extract_energy(text: &str) -> Result<HashMap<String, serde_json::Value>, String> {
    for line in text.lines().rev() {
        if line.contains("SCF ENDED") && line.contains("E(AU)") {
            let after = line
                .split("E(AU)")
                .nth(1)
                .ok_or_else(|| "malformed SCF ENDED line".to_string())?;
            // after looks like " =     -123.456789"
            let value = after
                .split_whitespace()
                .nth(1)
                .ok_or_else(|| "no energy value after E(AU)".to_string())?;
            let energy: f64 = value
                .parse()
                .map_err(|_| format!("unparseable energy value: {value}"))?;
            let mut out = HashMap::new();
            out.insert("final_energy".to_string(), json!(energy));
            return Ok(out);
        }
    }
    Err("no SCF ENDED line found".to_string())
}

/// Scans forward, preferring a DIRECT/INDIRECT ENERGY BAND GAP line and
/// falling back to the generic ENERGY BAND GAP line.
pub fn extract_bandgap(text: &str) -> Result<HashMap<String, serde_json::Value>, String> {
    for line in text.lines() {
        if line.contains("DIRECT ENERGY BAND GAP") || line.contains("INDIRECT ENERGY BAND GAP") {
            let gap = parse_gap_value(line)?;
            let gap_type = if line.contains("INDIRECT") {
                "indirect"
            } else {
                "direct"
            };
            let mut out = HashMap::new();
            out.insert("bandgap".to_string(), json!(gap));
            out.insert("bandgap_type".to_string(), json!(gap_type));
            return Ok(out);
        }
    }
    for line in text.lines() {
        if line.contains("ENERGY BAND GAP")
            && !line.contains("DIRECT")
            && !line.contains("INDIRECT")
        {
            let gap = parse_gap_value(line)?;
            let mut out = HashMap::new();
            out.insert("bandgap".to_string(), json!(gap));
            return Ok(out);
        }
    }
    Err("no ENERGY BAND GAP line found".to_string())
}

fn parse_gap_value(line: &str) -> Result<f64, String> {
    let after_colon = line
        .split(':')
        .nth(1)
        .ok_or_else(|| "malformed band gap line".to_string())?;
    let value = after_colon
        .split_whitespace()
        .next()
        .ok_or_else(|| "no value after colon".to_string())?;
    value
        .parse()
        .map_err(|_| format!("unparseable band gap value: {value}"))
}

/// Finds a "PRIMITIVE CELL" or "CRYSTALLOGRAPHIC CELL" header, then the
/// `A B C ALPHA BETA GAMMA` column header within the following few lines,
/// and reads the six values off the line directly after that header.
pub fn extract_lattice(text: &str) -> Result<HashMap<String, serde_json::Value>, String> {
    let lines: Vec<&str> = text.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        if line.contains("PRIMITIVE CELL") || line.contains("CRYSTALLOGRAPHIC CELL") {
            let upper_bound = (i + 10).min(lines.len());
            for j in (i + 1)..upper_bound {
                let header = lines[j];
                if header.contains('A') && header.contains('B') && header.contains('C') {
                    let Some(values_line) = lines.get(j + 1) else {
                        continue;
                    };
                    let values: Vec<&str> = values_line.split_whitespace().collect();
                    if values.len() < 6 {
                        continue;
                    }
                    let parsed: Result<Vec<f64>, _> =
                        values[..6].iter().map(|v| v.parse::<f64>()).collect();
                    let Ok(parsed) = parsed else { continue };
                    let mut out = HashMap::new();
                    out.insert("lattice_a".to_string(), json!(parsed[0]));
                    out.insert("lattice_b".to_string(), json!(parsed[1]));
                    out.insert("lattice_c".to_string(), json!(parsed[2]));
                    out.insert("lattice_alpha".to_string(), json!(parsed[3]));
                    out.insert("lattice_beta".to_string(), json!(parsed[4]));
                    out.insert("lattice_gamma".to_string(), json!(parsed[5]));
                    return Ok(out);
                }
            }
        }
    }
    Err("no lattice parameter section found".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_final_scf_energy_scanning_backwards() {
        let text = "\
== SCF ENDED - CONVERGENCE ON ENERGY      E(AU) = -1.0
some intermediate noise
== SCF ENDED - CONVERGENCE ON ENERGY      E(AU) = -75.31024812";
        let out = extract_energy(text).unwrap();
        assert_eq!(out["final_energy"], json!(-75.31024812));
    }

    #[test]
    fn energy_missing_is_an_error_not_a_panic() {
        assert!(extract_energy("nothing relevant here").is_err());
    }

    #[test]
    fn prefers_direct_indirect_bandgap_over_generic() {
        let text = "ENERGY BAND GAP:     1.000 eV\nDIRECT ENERGY BAND GAP:     3.210 eV";
        let out = extract_bandgap(text).unwrap();
        assert_eq!(out["bandgap"], json!(3.21));
        assert_eq!(out["bandgap_type"], json!("direct"));
    }

    #[test]
    fn falls_back_to_generic_bandgap_line() {
        let text = "ENERGY BAND GAP:     2.500 eV";
        let out = extract_bandgap(text).unwrap();
        assert_eq!(out["bandgap"], json!(2.5));
        assert!(!out.contains_key("bandgap_type"));
    }

    #[test]
    fn extracts_lattice_parameters() {
        let text = "\
 FINAL OPTIMIZED GEOMETRY
 PRIMITIVE CELL
   A          B          C        ALPHA      BETA       GAMMA
   5.430000   5.430000   5.430000  90.0000   90.0000    90.0000";
        let out = extract_lattice(text).unwrap();
        assert_eq!(out["lattice_a"], json!(5.43));
        assert_eq!(out["lattice_gamma"], json!(90.0));
    }
}
