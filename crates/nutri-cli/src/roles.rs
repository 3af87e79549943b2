//! # Roles Subcommand
//!
//! Prints the permission matrix of the built-in role table, or of a YAML
//! file in the `RBAC_CONFIG` format. Loading the file also validates it,
//! so `nutri roles --config roles.yaml` doubles as a config linter.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use nutri_core::{Permission, RoleTable};

/// Arguments for the `nutri roles` subcommand.
#[derive(Args, Debug)]
pub struct RolesArgs {
    /// Role table YAML (defaults to the built-in table).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Emit JSON (`{role: [codes]}`) instead of a table.
    #[arg(long)]
    pub json: bool,
}

/// Execute the roles subcommand.
pub fn run_roles(args: &RolesArgs) -> Result<u8> {
    let table = load_table(args.config.as_ref())?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&matrix_json(&table))?);
    } else {
        print!("{}", render_matrix(&table));
    }
    Ok(0)
}

fn load_table(path: Option<&PathBuf>) -> Result<RoleTable> {
    let Some(path) = path else {
        return Ok(RoleTable::builtin());
    };
    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    RoleTable::from_yaml(&yaml).with_context(|| format!("invalid role table {}", path.display()))
}

fn matrix_json(table: &RoleTable) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = table
        .iter()
        .map(|(role, perms)| {
            let codes = perms.iter().map(|p| p.code()).collect::<Vec<_>>();
            (role.as_str().to_string(), serde_json::json!(codes))
        })
        .collect();
    serde_json::Value::Object(map)
}

/// One row per permission, one column per role.
fn render_matrix(table: &RoleTable) -> String {
    let roles: Vec<_> = table.iter().collect();
    let code_width = Permission::ALL
        .iter()
        .map(|p| p.code().len())
        .max()
        .unwrap_or(0);

    let mut out = format!("{:code_width$}", "");
    for (role, _) in &roles {
        out.push_str("  ");
        out.push_str(role.as_str());
    }
    out.push('\n');

    for permission in Permission::ALL {
        out.push_str(&format!("{:code_width$}", permission.code()));
        for (role, perms) in &roles {
            let mark = if perms.contains(&permission) { "x" } else { "." };
            out.push_str(&format!("  {:^width$}", mark, width = role.as_str().len()));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_matrix_has_a_row_per_permission() {
        let text = render_matrix(&RoleTable::builtin());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), Permission::ALL.len() + 1);
        assert!(lines[0].contains("ADMIN"));
        assert!(lines[0].contains("VIEWER"));
        let audit = lines.iter().find(|l| l.starts_with("audit.read")).unwrap();
        assert_eq!(audit.matches('x').count(), 1);
    }

    #[test]
    fn loads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roles.yaml");
        std::fs::write(&path, "roles:\n  CLERK: [billing.read, billing.write]\n").unwrap();

        let table = load_table(Some(&path)).unwrap();
        let json = matrix_json(&table);
        assert_eq!(json["CLERK"], serde_json::json!(["billing.read", "billing.write"]));
        assert_eq!(
            json["ADMIN"].as_array().unwrap().len(),
            Permission::ALL.len()
        );
    }

    #[test]
    fn invalid_yaml_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roles.yaml");
        std::fs::write(&path, "roles:\n  CLERK: [nope.nope]\n").unwrap();
        assert!(load_table(Some(&path)).is_err());
        assert!(load_table(Some(&dir.path().join("missing.yaml"))).is_err());
    }
}
