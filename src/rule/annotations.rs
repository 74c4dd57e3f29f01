//! Declarative data-annotation style rules
//!
//! These are ordinary rules with a single trigger property, participating in
//! the same ordinal and message machinery as hand-written rules. Messages
//! are built from the property display name when one is declared.
//!
//! Annotations other than [`required`] pass on null values: absence is the
//! concern of `required`, so the two compose without producing duplicate
//! messages for an unset property.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use super::{Outcome, Rule, RuleContext, RuleDef};

struct Required {
    property: String,
}

#[async_trait]
impl Rule for Required {
    async fn execute(&self, ctx: RuleContext) -> anyhow::Result<Outcome> {
        let empty = match ctx.get(&self.property)? {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            _ => false,
        };

        if empty {
            let label = ctx.display_name(&self.property)?;
            return Ok(Outcome::invalid(&self.property, format!("{label} is required")));
        }
        Ok(Outcome::ok())
    }
}

/// The property must hold a non-null, non-blank value
pub fn required(property: impl Into<String>) -> RuleDef {
    let property = property.into();
    RuleDef::new([property.clone()], Required { property })
}

struct MinLength {
    property: String,
    min: usize,
}

#[async_trait]
impl Rule for MinLength {
    async fn execute(&self, ctx: RuleContext) -> anyhow::Result<Outcome> {
        match ctx.get(&self.property)? {
            Value::String(s) if s.chars().count() < self.min => {
                let label = ctx.display_name(&self.property)?;
                Ok(Outcome::invalid(
                    &self.property,
                    format!("{label} must be at least {} characters", self.min),
                ))
            }
            _ => Ok(Outcome::ok()),
        }
    }
}

/// String values must be at least `min` characters long
pub fn min_length(property: impl Into<String>, min: usize) -> RuleDef {
    let property = property.into();
    RuleDef::new([property.clone()], MinLength { property, min })
}

struct MaxLength {
    property: String,
    max: usize,
}

#[async_trait]
impl Rule for MaxLength {
    async fn execute(&self, ctx: RuleContext) -> anyhow::Result<Outcome> {
        match ctx.get(&self.property)? {
            Value::String(s) if s.chars().count() > self.max => {
                let label = ctx.display_name(&self.property)?;
                Ok(Outcome::invalid(
                    &self.property,
                    format!("{label} must be at most {} characters", self.max),
                ))
            }
            _ => Ok(Outcome::ok()),
        }
    }
}

/// String values must be at most `max` characters long
pub fn max_length(property: impl Into<String>, max: usize) -> RuleDef {
    let property = property.into();
    RuleDef::new([property.clone()], MaxLength { property, max })
}

struct Range {
    property: String,
    min: f64,
    max: f64,
}

#[async_trait]
impl Rule for Range {
    async fn execute(&self, ctx: RuleContext) -> anyhow::Result<Outcome> {
        match ctx.get(&self.property)? {
            Value::Number(n) => {
                let out_of_range = n.as_f64().map(|v| v < self.min || v > self.max);
                if out_of_range.unwrap_or(false) {
                    let label = ctx.display_name(&self.property)?;
                    return Ok(Outcome::invalid(
                        &self.property,
                        format!("{label} must be between {} and {}", self.min, self.max),
                    ));
                }
                Ok(Outcome::ok())
            }
            _ => Ok(Outcome::ok()),
        }
    }
}

/// Numeric values must fall within `[min, max]`
pub fn range(property: impl Into<String>, min: f64, max: f64) -> RuleDef {
    let property = property.into();
    RuleDef::new([property.clone()], Range { property, min, max })
}

struct Pattern {
    property: String,
    regex: Regex,
}

#[async_trait]
impl Rule for Pattern {
    async fn execute(&self, ctx: RuleContext) -> anyhow::Result<Outcome> {
        match ctx.get(&self.property)? {
            Value::Null => Ok(Outcome::ok()),
            Value::String(s) if self.regex.is_match(&s) => Ok(Outcome::ok()),
            _ => {
                let label = ctx.display_name(&self.property)?;
                Ok(Outcome::invalid(
                    &self.property,
                    format!("{label} has an invalid format"),
                ))
            }
        }
    }
}

/// String values must match the given pattern.
///
/// The regex is compiled by the caller so that an invalid pattern fails at
/// setup time rather than inside rule execution.
pub fn pattern(property: impl Into<String>, regex: Regex) -> RuleDef {
    let property = property.into();
    RuleDef::new([property.clone()], Pattern { property, regex })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{prop, Blueprint, Node};
    use crate::rule::RuleDef;

    fn probe(rule: RuleDef) -> Node {
        Blueprint::entity("Probe")
            .property(prop("v").display("Value"))
            .rule(rule)
            .fetch()
    }

    #[tokio::test]
    async fn required_rejects_null_and_blank() {
        let node = probe(required("v"));
        node.run_rules_for("v").await.unwrap();
        assert!(!node.is_valid());
        assert_eq!(node.messages()[0].text, "Value is required");

        node.set("v", "   ").unwrap();
        node.wait_for_tasks().await.unwrap();
        assert!(!node.is_valid());

        node.set("v", "present").unwrap();
        node.wait_for_tasks().await.unwrap();
        assert!(node.is_valid());
    }

    #[tokio::test]
    async fn length_bounds_pass_on_null() {
        let node = probe(min_length("v", 3));
        node.run_rules_for("v").await.unwrap();
        assert!(node.is_valid());

        node.set("v", "ab").unwrap();
        node.wait_for_tasks().await.unwrap();
        assert_eq!(
            node.messages()[0].text,
            "Value must be at least 3 characters"
        );

        node.set("v", "abc").unwrap();
        node.wait_for_tasks().await.unwrap();
        assert!(node.is_valid());
    }

    #[tokio::test]
    async fn max_length_counts_characters() {
        let node = probe(max_length("v", 4));
        node.set("v", "abcde").unwrap();
        node.wait_for_tasks().await.unwrap();
        assert!(!node.is_valid());

        node.set("v", "éèêë").unwrap();
        node.wait_for_tasks().await.unwrap();
        assert!(node.is_valid());
    }

    #[tokio::test]
    async fn range_bounds_numbers() {
        let node = probe(range("v", 0.0, 10.0));
        node.run_rules_for("v").await.unwrap();
        assert!(node.is_valid());

        node.set("v", 11).unwrap();
        node.wait_for_tasks().await.unwrap();
        assert_eq!(node.messages()[0].text, "Value must be between 0 and 10");

        node.set("v", 5).unwrap();
        node.wait_for_tasks().await.unwrap();
        assert!(node.is_valid());
    }

    #[tokio::test]
    async fn pattern_matches_strings() {
        let node = probe(pattern("v", Regex::new("^[a-z]+$").unwrap()));
        node.run_rules_for("v").await.unwrap();
        assert!(node.is_valid());

        node.set("v", "NOT LOWERCASE").unwrap();
        node.wait_for_tasks().await.unwrap();
        assert_eq!(node.messages()[0].text, "Value has an invalid format");

        node.set("v", "lowercase").unwrap();
        node.wait_for_tasks().await.unwrap();
        assert!(node.is_valid());
    }
}
