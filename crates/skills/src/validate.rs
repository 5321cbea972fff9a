//! Skill source validation.

use cm_domain::error::{Error, Result};
use cm_domain::skill::{validate_skill_name, SkillParameter};

/// Compile the source and confirm it defines a script-level `run`
/// function. Returns the reflected parameter list.
pub fn validate_source(source: &str) -> Result<Vec<SkillParameter>> {
    let engine = rhai::Engine::new_raw();
    let ast = engine
        .compile(source)
        .map_err(|e| Error::InvalidSource(format!("parse error: {e}")))?;

    let run = ast
        .iter_functions()
        .find(|f| f.name == "run")
        .ok_or_else(|| Error::InvalidSource("missing fn run(...) definition".into()))?;

    Ok(run
        .params
        .iter()
        .map(|p| SkillParameter {
            name: (*p).to_string(),
            type_hint: None,
            default: None,
            description: None,
        })
        .collect())
}

/// Full creation-time validation: name rules plus source rules.
pub fn validate_skill(name: &str, source: &str) -> Result<Vec<SkillParameter>> {
    validate_skill_name(name)?;
    validate_source(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_source_reflects_params() {
        let params = validate_source("fn run(n, factor) { n * factor }").unwrap();
        let names: Vec<_> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["n", "factor"]);
    }

    #[test]
    fn parse_errors_are_invalid_source() {
        let err = validate_source("fn run( {").unwrap_err();
        assert!(matches!(err, Error::InvalidSource(_)));
    }

    #[test]
    fn missing_run_is_invalid_source() {
        let err = validate_source("fn helper() { 1 }").unwrap_err();
        assert!(matches!(err, Error::InvalidSource(_)));
    }

    #[test]
    fn run_must_be_a_function_not_a_variable() {
        let err = validate_source("let run = 42;").unwrap_err();
        assert!(matches!(err, Error::InvalidSource(_)));
    }

    #[test]
    fn reserved_names_rejected_at_creation() {
        let err = validate_skill("tools", "fn run() { 1 }").unwrap_err();
        assert!(matches!(err, Error::InvalidName { .. }));
    }
}
