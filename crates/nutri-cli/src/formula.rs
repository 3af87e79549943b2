//! # Formula Subcommand
//!
//! Parses measure formulas offline, reports the variables they use (and
//! which of those are not codes in the built-in measure catalog), and
//! evaluates them against `--var name=value` bindings.

use std::collections::{BTreeSet, HashMap};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Subcommand};
use nutri_core::{Formula, MeasureCatalog};

/// Arguments for the `nutri formula` subcommand.
#[derive(Args, Debug)]
pub struct FormulaArgs {
    #[command(subcommand)]
    pub command: FormulaCommand,
}

/// Formula subcommands.
#[derive(Subcommand, Debug)]
pub enum FormulaCommand {
    /// Parse a formula and list its variables.
    Check {
        /// Formula source, e.g. `weight / (height / 100) ^ 2`.
        #[arg(value_name = "FORMULA")]
        source: String,
    },

    /// Evaluate a formula.
    Eval {
        /// Formula source.
        #[arg(value_name = "FORMULA")]
        source: String,
        /// Variable binding `name=value`. Repeatable.
        #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_binding)]
        vars: Vec<(String, f64)>,
    },
}

fn parse_binding(raw: &str) -> Result<(String, f64), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{raw}'"))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("'{value}' is not a number"))?;
    Ok((name.trim().to_string(), value))
}

/// Execute the formula subcommand.
pub fn run_formula(args: &FormulaArgs) -> Result<u8> {
    match &args.command {
        FormulaCommand::Check { source } => cmd_check(source),
        FormulaCommand::Eval { source, vars } => {
            let result = cmd_eval(source, vars)?;
            println!("{result}");
            Ok(0)
        }
    }
}

/// Variables of `formula` that are not catalog codes.
fn unknown_variables(formula: &Formula) -> BTreeSet<String> {
    let catalog = MeasureCatalog::builtin();
    formula
        .variables()
        .into_iter()
        .filter(|v| catalog.get(v).is_none())
        .collect()
}

fn cmd_check(source: &str) -> Result<u8> {
    let formula = match Formula::parse(source) {
        Ok(f) => f,
        Err(e) => {
            println!("FAIL: {e}");
            return Ok(1);
        }
    };
    let variables = formula.variables();
    println!("OK: formula parses");
    println!(
        "  variables: {}",
        variables.into_iter().collect::<Vec<_>>().join(", ")
    );
    let unknown = unknown_variables(&formula);
    if !unknown.is_empty() {
        println!(
            "  not in built-in catalog: {}",
            unknown.into_iter().collect::<Vec<_>>().join(", ")
        );
    }
    Ok(0)
}

fn cmd_eval(source: &str, vars: &[(String, f64)]) -> Result<f64> {
    let formula = Formula::parse(source).context("invalid formula")?;
    let values: HashMap<String, f64> = vars.iter().cloned().collect();
    let missing: Vec<String> = formula
        .variables()
        .into_iter()
        .filter(|v| !values.contains_key(v))
        .collect();
    if !missing.is_empty() {
        return Err(anyhow!("missing --var for: {}", missing.join(", ")));
    }
    Ok(formula.evaluate(&values)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_bmi() {
        let vars = vec![("weight".to_string(), 81.0), ("height".to_string(), 180.0)];
        let bmi = cmd_eval("weight / (height / 100) ^ 2", &vars).unwrap();
        assert!((bmi - 25.0).abs() < 1e-9);
    }

    #[test]
    fn missing_bindings_are_named() {
        let err = cmd_eval("weight / height", &[("weight".into(), 80.0)]).unwrap_err();
        assert!(err.to_string().contains("height"));
    }

    #[test]
    fn check_reports_parse_failure_as_exit_code() {
        assert_eq!(cmd_check("weight / (height").unwrap(), 1);
        assert_eq!(cmd_check("weight * 2").unwrap(), 0);
    }

    #[test]
    fn unknown_variables_exclude_catalog_codes() {
        let formula = Formula::parse("weight + shoe_size").unwrap();
        let unknown = unknown_variables(&formula);
        assert_eq!(unknown.into_iter().collect::<Vec<_>>(), vec!["shoe_size"]);
    }

    #[test]
    fn bindings_parse() {
        assert_eq!(parse_binding("weight=80.5").unwrap(), ("weight".into(), 80.5));
        assert!(parse_binding("weight").is_err());
        assert!(parse_binding("weight=abc").is_err());
    }
}
