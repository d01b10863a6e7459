//! Parsing of the skeema diff clause injected into a PR magic comment.
//!
//! The CI tool appends a block of the following shape to a comment (or to
//! the PR body), and this module extracts the DDL statements plus the file
//! and schema hints from it:
//!
//! ```text
//! <!-- skeema:magic:comment -->
//! -- skeema:diff
//! -- skeema:ddl:use skeema:my_schema;
//! -- skeema:ddl:begin
//! ALTER TABLE my_table ADD COLUMN dummy tinyint(4) NOT NULL DEFAULT '0';
//! -- skeema:ddl:end
//! ```

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;

static DIFF_STATEMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\n-- skeema:ddl:begin(.*?)\n-- skeema:ddl:end").unwrap());
static DIFF_FILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\n-- skeema:diff:file (.*?)\n").unwrap());
static DIFF_USE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\n-- skeema:ddl:use (.*?)\n").unwrap());
static ALTER_DATABASE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("ALTER DATABASE `(.*?)` (.+)$").unwrap());
static CREATE_TABLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new("CREATE TABLE `(.*?)`").unwrap());
static DROP_TABLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new("DROP TABLE `(.*?)`").unwrap());
static ALTER_TABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("ALTER TABLE `(.*?)` (.+)$").unwrap());

pub const MAX_TABLE_NAME_LENGTH: usize = 64;

const MAGIC_COMMENT_MARKER: &str = "<!-- skeema:magic:comment -->";
const DIFF_MARKER: &str = "<!-- skeema:diff -->";

/// The parsed content of a skeema diff clause.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkeemaDiffInfo {
    pub statements: Vec<String>,
    pub file_name: String,
    pub schema_name: String,
}

/// Parse the magic text injected into a PR magic comment.
///
/// The suffix after the last marker occurrence is the diff clause; within
/// it, each `ddl:begin`/`ddl:end` span is one statement, in input order.
/// Returns an empty `SkeemaDiffInfo` when no marker is present.
pub fn parse_skeema_diff(comment_body: &str) -> SkeemaDiffInfo {
    let mut info = SkeemaDiffInfo::default();

    let clause = match last_split(comment_body, MAGIC_COMMENT_MARKER) {
        Some(clause) => clause,
        None => match last_split(comment_body, DIFF_MARKER) {
            Some(clause) => clause,
            None => return info,
        },
    };

    if let Some(captures) = DIFF_FILE_RE.captures(clause) {
        info.file_name = captures[1].trim().to_string();
    }
    if let Some(captures) = DIFF_USE_RE.captures(clause) {
        let mut schema = captures[1].trim();
        schema = schema.trim_matches(';').trim();
        schema = schema.trim_matches('`');
        // Strip any `prefix:` namespace, keeping the text after the last colon.
        if let Some(idx) = schema.rfind(':') {
            schema = &schema[idx + 1..];
        }
        info.schema_name = schema.to_string();
    }
    for captures in DIFF_STATEMENT_RE.captures_iter(clause) {
        info.statements.push(captures[1].trim().to_string());
    }

    info
}

/// The suffix following the last occurrence of `marker`, or `None` when the
/// marker does not appear at all.
fn last_split<'a>(body: &'a str, marker: &str) -> Option<&'a str> {
    body.rfind(marker).map(|idx| &body[idx + marker.len()..])
}

pub fn dissect_create_table_statement(statement: &str) -> Result<String> {
    let captures = CREATE_TABLE_RE
        .captures(statement)
        .ok_or_else(|| anyhow!("cannot dissect CREATE statement: {}", statement))?;
    Ok(captures[1].to_string())
}

pub fn dissect_drop_table_statement(statement: &str) -> Result<String> {
    let captures = DROP_TABLE_RE
        .captures(statement)
        .ok_or_else(|| anyhow!("cannot dissect DROP statement: {}", statement))?;
    Ok(captures[1].to_string())
}

/// Returns `(table_name, alter_clause, has_drop_column)`.
pub fn dissect_alter_table_statement(statement: &str) -> Result<(String, String, bool)> {
    let captures = ALTER_TABLE_RE
        .captures(statement)
        .ok_or_else(|| anyhow!("cannot dissect ALTER statement: {}", statement))?;
    let table_name = captures[1].to_string();
    let alter = captures[2].to_string();
    let has_drop_column = alter.contains("DROP COLUMN");
    Ok((table_name, alter, has_drop_column))
}

/// Returns `(database_name, alter_clause)`.
pub fn dissect_alter_database_statement(statement: &str) -> Result<(String, String)> {
    let captures = ALTER_DATABASE_RE
        .captures(statement)
        .ok_or_else(|| anyhow!("cannot dissect ALTER DATABASE statement: {}", statement))?;
    Ok((captures[1].to_string(), captures[2].to_string()))
}

/// `{base}_{suffix}`, trimming `base` from the right so the result never
/// exceeds the MySQL table name limit of 64 characters.
pub fn get_safe_table_name_with_suffix(base_name: &str, suffix: &str) -> String {
    let name = format!("{}_{}", base_name, suffix);
    if name.len() <= MAX_TABLE_NAME_LENGTH {
        return name;
    }
    let extra_characters = name.len() - MAX_TABLE_NAME_LENGTH;
    format!(
        "{}_{}",
        &base_name[..base_name.len() - extra_characters],
        suffix
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_body() {
        let info = parse_skeema_diff("");
        assert_eq!(info.statements.len(), 0);
        assert_eq!(info.file_name, "");
        assert_eq!(info.schema_name, "");
    }

    #[test]
    fn test_parse_no_marker() {
        let b = "
-- skeema:ddl:begin
ALTER TABLE sample_data ADD COLUMN i int(11) NOT NULL DEFAULT '7' AFTER time_updated;
-- skeema:ddl:end

		";
        let info = parse_skeema_diff(b);
        assert_eq!(info.statements.len(), 0);
        assert_eq!(info.file_name, "");
        assert_eq!(info.schema_name, "");
    }

    #[test]
    fn test_parse_diff_marker() {
        let b = "
<!-- skeema:diff -->
-- skeema:ddl:begin
ALTER TABLE sample_data ADD COLUMN i int(11) NOT NULL DEFAULT '7' AFTER time_updated;
-- skeema:ddl:end

		";
        let info = parse_skeema_diff(b);
        assert_eq!(info.statements.len(), 1);
        assert_eq!(info.file_name, "");
        assert_eq!(info.schema_name, "");
        assert_eq!(
            info.statements[0],
            "ALTER TABLE sample_data ADD COLUMN i int(11) NOT NULL DEFAULT '7' AFTER time_updated;"
        );
    }

    #[test]
    fn test_parse_magic_comment_marker() {
        let b = "
<!-- skeema:magic:comment -->
-- skeema:ddl:begin
ALTER TABLE sample_data ADD COLUMN i int(11) NOT NULL DEFAULT '7' AFTER time_updated;
-- skeema:ddl:end

		";
        let info = parse_skeema_diff(b);
        assert_eq!(info.statements.len(), 1);
        assert_eq!(
            info.statements[0],
            "ALTER TABLE sample_data ADD COLUMN i int(11) NOT NULL DEFAULT '7' AFTER time_updated;"
        );
    }

    #[test]
    fn test_parse_use_schema() {
        let b = "
<!-- skeema:magic:comment -->
-- skeema:ddl:use some_schema
-- skeema:ddl:begin
ALTER TABLE sample_data ADD COLUMN i int(11) NOT NULL DEFAULT '7' AFTER time_updated;
-- skeema:ddl:end
		";
        let info = parse_skeema_diff(b);
        assert_eq!(info.statements.len(), 1);
        assert_eq!(info.file_name, "");
        assert_eq!(info.schema_name, "some_schema");
    }

    #[test]
    fn test_parse_use_schema_backticks() {
        let b = "
<!-- skeema:magic:comment -->
-- skeema:ddl:use `some_schema`
-- skeema:ddl:begin
ALTER TABLE sample_data ADD COLUMN i int(11) NOT NULL DEFAULT '7' AFTER time_updated;
-- skeema:ddl:end
		";
        let info = parse_skeema_diff(b);
        assert_eq!(info.schema_name, "some_schema");
    }

    #[test]
    fn test_parse_use_schema_namespaced() {
        let b = "
<!-- skeema:magic:comment -->
-- skeema:ddl:use `skeema-ci:some_schema`
-- skeema:ddl:begin
ALTER TABLE sample_data ADD COLUMN i int(11) NOT NULL DEFAULT '7' AFTER time_updated;
-- skeema:ddl:end
		";
        let info = parse_skeema_diff(b);
        assert_eq!(info.schema_name, "some_schema");
    }

    #[test]
    fn test_parse_use_schema_namespaced_semicolon() {
        let b = "
<!-- skeema:magic:comment -->
-- skeema:ddl:use `skeema-ci:some_schema`;
-- skeema:ddl:begin
ALTER TABLE sample_data ADD COLUMN i int(11) NOT NULL DEFAULT '7' AFTER time_updated;
-- skeema:ddl:end
		";
        let info = parse_skeema_diff(b);
        assert_eq!(info.schema_name, "some_schema");
    }

    #[test]
    fn test_parse_diff_file() {
        let b = "
<!-- skeema:diff -->
-- skeema:diff:file collab-structure.sql
-- skeema:ddl:begin
ALTER TABLE sample_data ADD COLUMN i int(11) NOT NULL DEFAULT '7' AFTER time_updated;
-- skeema:ddl:end

		";
        let info = parse_skeema_diff(b);
        assert_eq!(info.statements.len(), 1);
        assert_eq!(info.file_name, "collab-structure.sql");
        assert_eq!(info.schema_name, "");
    }

    #[test]
    fn test_parse_multiple_statements() {
        let b = "
<!-- skeema:magic:comment -->
-- skeema:ddl:begin
ALTER TABLE sample_data ADD COLUMN i int(11) NOT NULL DEFAULT '7' AFTER time_updated;
-- skeema:ddl:end
-- skeema:ddl:begin
CREATE TABLE table_0 (
id int(10) unsigned NOT NULL AUTO_INCREMENT,
name varchar(128) NOT NULL,
PRIMARY KEY (id)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;
-- skeema:ddl:end
		";
        let info = parse_skeema_diff(b);
        assert_eq!(info.statements.len(), 2);
        assert_eq!(
            info.statements[0],
            "ALTER TABLE sample_data ADD COLUMN i int(11) NOT NULL DEFAULT '7' AFTER time_updated;"
        );
        assert_eq!(
            info.statements[1],
            "CREATE TABLE table_0 (
id int(10) unsigned NOT NULL AUTO_INCREMENT,
name varchar(128) NOT NULL,
PRIMARY KEY (id)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;"
        );
    }

    #[test]
    fn test_parse_last_marker_wins() {
        let b = "
<!-- skeema:magic:comment -->
-- skeema:ddl:begin
DROP TABLE `stale`
-- skeema:ddl:end
<!-- skeema:magic:comment -->
-- skeema:ddl:begin
CREATE TABLE `fresh` (id int)
-- skeema:ddl:end
		";
        let info = parse_skeema_diff(b);
        assert_eq!(info.statements.len(), 1);
        assert_eq!(info.statements[0], "CREATE TABLE `fresh` (id int)");
    }

    #[test]
    fn test_dissect_drop_table() {
        assert!(dissect_drop_table_statement("").is_err());
        assert!(dissect_drop_table_statement("DROP TABLE zzz").is_err());
        assert_eq!(
            dissect_drop_table_statement("DROP TABLE `zzz`").unwrap(),
            "zzz"
        );
        assert_eq!(
            dissect_drop_table_statement("DROP TABLE `zzz` ;").unwrap(),
            "zzz"
        );
    }

    #[test]
    fn test_dissect_create_table() {
        assert!(dissect_create_table_statement("CREATE TABLE zzz (id int)").is_err());
        assert_eq!(
            dissect_create_table_statement("CREATE TABLE `zzz` (id int)").unwrap(),
            "zzz"
        );
    }

    #[test]
    fn test_dissect_alter_table() {
        assert!(dissect_alter_table_statement("").is_err());
        assert!(dissect_alter_table_statement("ALTER TABLE zzz").is_err());
        assert!(dissect_alter_table_statement("ALTER TABLE `zzz`").is_err());
        {
            let (table_name, alter, has_drop_column) =
                dissect_alter_table_statement("ALTER TABLE `zzz` ADD COLUMN `i` INT NOT NULL DEFAULT 0")
                    .unwrap();
            assert!(!has_drop_column);
            assert_eq!(table_name, "zzz");
            assert_eq!(alter, "ADD COLUMN `i` INT NOT NULL DEFAULT 0");
        }
        {
            let (table_name, alter, has_drop_column) = dissect_alter_table_statement(
                "ALTER TABLE `zzz` ADD COLUMN `i` INT NOT NULL DEFAULT 0, ADD INDEX i_idx(i)",
            )
            .unwrap();
            assert!(!has_drop_column);
            assert_eq!(table_name, "zzz");
            assert_eq!(alter, "ADD COLUMN `i` INT NOT NULL DEFAULT 0, ADD INDEX i_idx(i)");
        }
        {
            let (table_name, alter, has_drop_column) = dissect_alter_table_statement(
                "ALTER TABLE `zzz` ADD COLUMN `i` INT NOT NULL DEFAULT 0, DROP COLUMN `j`",
            )
            .unwrap();
            assert!(has_drop_column);
            assert_eq!(table_name, "zzz");
            assert_eq!(alter, "ADD COLUMN `i` INT NOT NULL DEFAULT 0, DROP COLUMN `j`");
        }
    }

    #[test]
    fn test_dissect_alter_database() {
        let (database_name, alter) =
            dissect_alter_database_statement("ALTER DATABASE `zzz` CHARACTER SET utf8mb4").unwrap();
        assert_eq!(database_name, "zzz");
        assert_eq!(alter, "CHARACTER SET utf8mb4");
    }

    #[test]
    fn test_safe_table_name_with_suffix() {
        {
            let tbl = "some_table";
            assert_eq!(get_safe_table_name_with_suffix(tbl, "DRP"), "some_table_DRP");
            assert_eq!(
                get_safe_table_name_with_suffix(&format!("_{}", tbl), "DRP"),
                "_some_table_DRP"
            );
        }
        {
            let tbl = "a123456789012345678901234567890123456789012345678901234567890";
            assert_eq!(
                get_safe_table_name_with_suffix(tbl, "DRP"),
                "a12345678901234567890123456789012345678901234567890123456789_DRP"
            );
            assert_eq!(
                get_safe_table_name_with_suffix(&format!("_{}", tbl), "DRP"),
                "_a1234567890123456789012345678901234567890123456789012345678_DRP"
            );
        }
    }

    #[test]
    fn test_safe_table_name_length_bound() {
        for base in ["t", "a_table", &"x".repeat(80)] {
            let name = get_safe_table_name_with_suffix(base, "DRP");
            assert!(name.len() <= MAX_TABLE_NAME_LENGTH);
            assert!(name.ends_with("_DRP"));
        }
    }
}
