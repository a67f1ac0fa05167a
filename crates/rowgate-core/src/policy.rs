//! Row-level policy definitions.
//!
//! A policy grants (permissive) or narrows (restrictive) access to the rows of
//! one collection for one command. Policies are immutable once registered;
//! redefinition replaces the whole policy.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::expr::{parse, Expr};

const USING: &str = "USING";
const WITH_CHECK: &str = "WITH CHECK";

/// Commands a policy can apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Command {
    /// Read operations.
    #[serde(alias = "select")]
    Select,
    /// Insert operations.
    #[serde(alias = "insert")]
    Insert,
    /// Update operations.
    #[serde(alias = "update")]
    Update,
    /// Delete operations.
    #[serde(alias = "delete")]
    Delete,
    /// Every command.
    #[serde(alias = "all")]
    All,
}

impl Command {
    /// Concrete commands a request can carry.
    pub const CONCRETE: [Command; 4] = [
        Command::Select,
        Command::Insert,
        Command::Update,
        Command::Delete,
    ];

    /// Keyword form.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Select => "SELECT",
            Command::Insert => "INSERT",
            Command::Update => "UPDATE",
            Command::Delete => "DELETE",
            Command::All => "ALL",
        }
    }

    /// Check if a policy registered for this command covers the requested one.
    pub fn covers(self, requested: Command) -> bool {
        self == Command::All || self == requested
    }

    /// Phases evaluated for this command, in order.
    pub fn phases(self) -> &'static [Phase] {
        match self {
            Command::Select | Command::Delete => &[Phase::Using],
            Command::Insert => &[Phase::Check],
            Command::Update | Command::All => &[Phase::Using, Phase::Check],
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SELECT" => Ok(Command::Select),
            "INSERT" => Ok(Command::Insert),
            "UPDATE" => Ok(Command::Update),
            "DELETE" => Ok(Command::Delete),
            "ALL" => Ok(Command::All),
            _ => Err(ConfigurationError::UnknownCommand(s.to_string())),
        }
    }
}

/// Commands that mutate a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteCommand {
    Insert,
    Update,
    Delete,
}

impl From<WriteCommand> for Command {
    fn from(command: WriteCommand) -> Self {
        match command {
            WriteCommand::Insert => Command::Insert,
            WriteCommand::Update => Command::Update,
            WriteCommand::Delete => Command::Delete,
        }
    }
}

impl fmt::Display for WriteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Command::from(*self).fmt(f)
    }
}

impl FromStr for WriteCommand {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<Command>()? {
            Command::Insert => Ok(WriteCommand::Insert),
            Command::Update => Ok(WriteCommand::Update),
            Command::Delete => Ok(WriteCommand::Delete),
            _ => Err(ConfigurationError::UnknownCommand(s.to_string())),
        }
    }
}

/// Which expression of a policy is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Qualifies existing rows (`USING`).
    Using,
    /// Qualifies proposed rows (`WITH CHECK`).
    Check,
}

impl Phase {
    /// Clause keyword for diagnostics.
    pub fn clause(self) -> &'static str {
        match self {
            Phase::Using => USING,
            Phase::Check => WITH_CHECK,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.clause())
    }
}

/// How a policy combines with the others on the same command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyType {
    /// Row is accessible if ANY permissive policy matches.
    #[default]
    Permissive,
    /// Row is accessible only if ALL restrictive policies match.
    Restrictive,
}

/// Row-level policy for one collection and command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PolicyDef", into = "PolicyDef")]
pub struct Policy {
    /// Policy name, unique within collection and command.
    pub name: String,
    /// Target collection.
    pub collection: String,
    /// Command this policy applies to.
    pub command: Command,
    /// Roles this policy applies to. Empty means every role.
    pub roles: BTreeSet<String>,
    /// Predicate over existing rows.
    pub using: Option<Expr>,
    /// Predicate over proposed rows.
    pub check: Option<Expr>,
    /// Permissive or restrictive.
    pub policy_type: PolicyType,
}

impl Policy {
    /// Create a permissive policy for every role, with no expressions yet.
    pub fn new(name: impl Into<String>, collection: impl Into<String>, command: Command) -> Self {
        Self {
            name: name.into(),
            collection: collection.into(),
            command,
            roles: BTreeSet::new(),
            using: None,
            check: None,
            policy_type: PolicyType::Permissive,
        }
    }

    /// Set the `USING` expression.
    pub fn using(mut self, expr: Expr) -> Self {
        self.using = Some(expr);
        self
    }

    /// Set the `WITH CHECK` expression.
    pub fn check(mut self, expr: Expr) -> Self {
        self.check = Some(expr);
        self
    }

    /// Parse and set the `USING` expression.
    pub fn using_source(self, source: &str) -> Result<Self, ConfigurationError> {
        let expr = self.parse_clause(USING, source)?;
        Ok(self.using(expr))
    }

    /// Parse and set the `WITH CHECK` expression.
    pub fn check_source(self, source: &str) -> Result<Self, ConfigurationError> {
        let expr = self.parse_clause(WITH_CHECK, source)?;
        Ok(self.check(expr))
    }

    /// Restrict the policy to a role. May be called repeatedly.
    pub fn for_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// Restrict the policy to a set of roles.
    pub fn for_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Set the policy type.
    pub fn with_type(mut self, policy_type: PolicyType) -> Self {
        self.policy_type = policy_type;
        self
    }

    /// Make the policy restrictive.
    pub fn restrictive(self) -> Self {
        self.with_type(PolicyType::Restrictive)
    }

    /// Check if this policy is restrictive.
    pub fn is_restrictive(&self) -> bool {
        self.policy_type == PolicyType::Restrictive
    }

    /// Check if the policy applies to a role.
    pub fn applies_to_role(&self, role: &str) -> bool {
        self.roles.is_empty() || self.roles.contains(role)
    }

    /// Check if the policy applies to a command and role.
    pub fn applies_to(&self, command: Command, role: &str) -> bool {
        self.command.covers(command) && self.applies_to_role(role)
    }

    /// Expression evaluated in a phase.
    ///
    /// `None` means the policy admits every row in that phase (an ALL policy
    /// without expressions). An UPDATE policy with only one expression uses
    /// it for both phases.
    pub fn expr_for(&self, phase: Phase) -> Option<&Expr> {
        match phase {
            Phase::Using => self.using.as_ref().or(self.check.as_ref()),
            Phase::Check => self.check.as_ref().or(self.using.as_ref()),
        }
    }

    /// Top-level claim keys referenced by either expression.
    pub fn claim_roots(&self) -> BTreeSet<String> {
        self.using
            .iter()
            .chain(self.check.iter())
            .flat_map(Expr::claim_paths)
            .filter_map(|path| path.split('.').next().map(str::to_string))
            .collect()
    }

    /// Validate structural rules for the policy's command.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.collection.trim().is_empty() {
            return Err(ConfigurationError::EmptyCollection {
                policy: self.name.clone(),
            });
        }
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::EmptyName {
                collection: self.collection.clone(),
            });
        }

        let has_using = self.using.is_some();
        let has_check = self.check.is_some();
        match self.command {
            Command::Select | Command::Delete => {
                if has_check {
                    return Err(self.unexpected(WITH_CHECK));
                }
                if !has_using {
                    return Err(self.missing(USING));
                }
            }
            Command::Insert => {
                if has_using {
                    return Err(self.unexpected(USING));
                }
                if !has_check {
                    return Err(self.missing(WITH_CHECK));
                }
            }
            Command::Update => {
                if !has_using && !has_check {
                    return Err(ConfigurationError::EmptyUpdate {
                        policy: self.name.clone(),
                    });
                }
            }
            Command::All => {
                if has_using != has_check {
                    return Err(ConfigurationError::IncompleteAll {
                        policy: self.name.clone(),
                    });
                }
            }
        }

        for (clause, expr) in [(USING, &self.using), (WITH_CHECK, &self.check)] {
            if let Some(literal) = expr.as_ref().and_then(Expr::unprintable_literal) {
                return Err(ConfigurationError::UnprintableLiteral {
                    policy: self.name.clone(),
                    clause,
                    literal: literal.to_string(),
                });
            }
        }
        Ok(())
    }

    fn missing(&self, clause: &'static str) -> ConfigurationError {
        ConfigurationError::MissingExpression {
            policy: self.name.clone(),
            command: self.command,
            clause,
        }
    }

    fn unexpected(&self, clause: &'static str) -> ConfigurationError {
        ConfigurationError::UnexpectedExpression {
            policy: self.name.clone(),
            command: self.command,
            clause,
        }
    }

    fn parse_clause(&self, clause: &'static str, text: &str) -> Result<Expr, ConfigurationError> {
        parse(text).map_err(|source| ConfigurationError::InvalidExpression {
            policy: self.name.clone(),
            clause,
            expression: text.to_string(),
            source,
        })
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.policy_type {
            PolicyType::Permissive => "PERMISSIVE",
            PolicyType::Restrictive => "RESTRICTIVE",
        };
        write!(
            f,
            "POLICY {} ON {} AS {} FOR {}",
            self.name, self.collection, kind, self.command
        )?;
        if !self.roles.is_empty() {
            let roles: Vec<&str> = self.roles.iter().map(String::as_str).collect();
            write!(f, " TO {}", roles.join(", "))?;
        }
        if let Some(using) = &self.using {
            write!(f, " USING ({})", using)?;
        }
        if let Some(check) = &self.check {
            write!(f, " WITH CHECK ({})", check)?;
        }
        Ok(())
    }
}

/// Text form of a policy, as stored and exchanged in bundles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDef {
    pub name: String,
    pub collection: String,
    pub command: Command,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub using: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    #[serde(default)]
    pub restrictive: bool,
}

impl TryFrom<PolicyDef> for Policy {
    type Error = ConfigurationError;

    fn try_from(def: PolicyDef) -> Result<Self, Self::Error> {
        let mut policy = Policy::new(def.name, def.collection, def.command).for_roles(def.roles);
        if def.restrictive {
            policy = policy.restrictive();
        }
        if let Some(source) = def.using.as_deref() {
            policy = policy.using_source(source)?;
        }
        if let Some(source) = def.check.as_deref() {
            policy = policy.check_source(source)?;
        }
        policy.validate()?;
        Ok(policy)
    }
}

impl From<Policy> for PolicyDef {
    fn from(policy: Policy) -> Self {
        PolicyDef {
            restrictive: policy.is_restrictive(),
            using: policy.using.as_ref().map(ToString::to_string),
            check: policy.check.as_ref().map(ToString::to_string),
            roles: policy.roles.into_iter().collect(),
            name: policy.name,
            collection: policy.collection,
            command: policy.command,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn owner_expr() -> Expr {
        Expr::eq(Expr::column("owner_id"), Expr::claim("sub"))
    }

    #[test]
    fn test_policy_builder() {
        let policy = Policy::new("owner_can_read", "projects", Command::Select)
            .using(owner_expr())
            .for_role("authenticated");

        assert_eq!(policy.name, "owner_can_read");
        assert!(!policy.is_restrictive());
        assert!(policy.applies_to(Command::Select, "authenticated"));
        assert!(!policy.applies_to(Command::Select, "anon"));
        assert!(!policy.applies_to(Command::Delete, "authenticated"));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_all_command_covers_everything() {
        let policy = Policy::new("open", "projects", Command::All);
        for command in Command::CONCRETE {
            assert!(policy.applies_to(command, "anyone"));
        }
        assert!(policy.validate().is_ok());
        assert_eq!(policy.expr_for(Phase::Using), None);
        assert_eq!(policy.expr_for(Phase::Check), None);
    }

    #[test]
    fn test_validation_rules() {
        let select = Policy::new("s", "c", Command::Select);
        assert!(matches!(
            select.validate(),
            Err(ConfigurationError::MissingExpression { clause: USING, .. })
        ));
        let select = select.using(owner_expr()).check(owner_expr());
        assert!(matches!(
            select.validate(),
            Err(ConfigurationError::UnexpectedExpression { clause: WITH_CHECK, .. })
        ));

        let insert = Policy::new("i", "c", Command::Insert).using(owner_expr());
        assert!(matches!(
            insert.validate(),
            Err(ConfigurationError::UnexpectedExpression { clause: USING, .. })
        ));

        let update = Policy::new("u", "c", Command::Update);
        assert!(matches!(update.validate(), Err(ConfigurationError::EmptyUpdate { .. })));
        assert!(update.check(owner_expr()).validate().is_ok());

        let all = Policy::new("a", "c", Command::All).using(owner_expr());
        assert!(matches!(all.validate(), Err(ConfigurationError::IncompleteAll { .. })));

        assert!(matches!(
            Policy::new("", "c", Command::All).validate(),
            Err(ConfigurationError::EmptyName { .. })
        ));
        assert!(matches!(
            Policy::new("p", " ", Command::All).validate(),
            Err(ConfigurationError::EmptyCollection { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_unprintable_literals() {
        let object = Expr::eq(
            Expr::column("meta"),
            Expr::Literal(serde_json::json!({ "a": 1 }).into()),
        );
        let err = Policy::new("obj", "c", Command::Select)
            .using(object)
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::UnprintableLiteral { clause: USING, .. }
        ));

        let nan = Expr::eq(Expr::column("score"), Expr::lit(f64::NAN));
        assert!(matches!(
            Policy::new("nan", "c", Command::Insert).check(nan).validate(),
            Err(ConfigurationError::UnprintableLiteral { clause: WITH_CHECK, .. })
        ));
    }

    #[test]
    fn test_update_expression_fallback() {
        let policy = Policy::new("u", "c", Command::Update).using(owner_expr());
        assert_eq!(policy.expr_for(Phase::Using), Some(&owner_expr()));
        assert_eq!(policy.expr_for(Phase::Check), Some(&owner_expr()));
    }

    #[test]
    fn test_source_parse_error() {
        let err = Policy::new("bad", "c", Command::Select)
            .using_source("owner_id = ")
            .unwrap_err();
        let ConfigurationError::InvalidExpression {
            clause,
            expression,
            source,
            ..
        } = &err
        else {
            panic!("expected an invalid expression, got {:?}", err);
        };
        assert_eq!(*clause, USING);
        assert_eq!(expression, "owner_id = ");
        assert!(source.format_with_source(expression).contains('^'));
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn test_command_parse() {
        assert_eq!("select".parse::<Command>().unwrap(), Command::Select);
        assert_eq!("ALL".parse::<Command>().unwrap(), Command::All);
        assert!("merge".parse::<Command>().is_err());
        assert_eq!("delete".parse::<WriteCommand>().unwrap(), WriteCommand::Delete);
        assert!("select".parse::<WriteCommand>().is_err());
        assert_eq!(WriteCommand::Update.to_string(), "UPDATE");
    }

    #[test]
    fn test_serde_text_form() {
        let json = r#"{
            "name": "team_members",
            "collection": "tasks",
            "command": "select",
            "roles": ["authenticated"],
            "using": "team_id IN claims.app_metadata.teams"
        }"#;
        let policy: Policy = serde_json::from_str(json).unwrap();
        assert_eq!(policy.command, Command::Select);
        assert!(policy.applies_to_role("authenticated"));

        let encoded = serde_json::to_string(&policy).unwrap();
        let decoded: Policy = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, policy);
    }

    #[test]
    fn test_serde_rejects_invalid_policy() {
        let json = r#"{"name": "x", "collection": "c", "command": "INSERT"}"#;
        assert!(serde_json::from_str::<Policy>(json).is_err());
    }

    #[test]
    fn test_claim_roots() {
        let policy = Policy::new("p", "c", Command::Update)
            .using_source("owner_id = claims.sub")
            .unwrap()
            .check_source("has_claim('user_metadata.admin')")
            .unwrap();
        let roots: Vec<_> = policy.claim_roots().into_iter().collect();
        assert_eq!(roots, vec!["sub".to_string(), "user_metadata".to_string()]);
    }

    #[test]
    fn test_display() {
        let policy = Policy::new("active_only", "docs", Command::Select)
            .using(Expr::eq(Expr::column("status"), Expr::lit("active")))
            .restrictive();
        assert_eq!(
            policy.to_string(),
            "POLICY active_only ON docs AS RESTRICTIVE FOR SELECT USING (status = 'active')"
        );
    }
}
