//! Integration tests for read filtering and write authorization.

use std::sync::Arc;

use rowgate_core::{
    AccessGate, ClaimsContext, Command, EnforcementMode, Evaluator, Expr, Policy, PolicyBundle,
    PolicyCatalog, PolicyStore, Row, Value, WriteCommand,
};

struct TestContext {
    store: Arc<PolicyStore>,
    gate: AccessGate,
}

impl TestContext {
    fn new() -> Self {
        let store = Arc::new(PolicyStore::new());
        let gate = AccessGate::new(Arc::clone(&store));
        Self { store, gate }
    }

    fn register(&self, policy: Policy) {
        self.store.register(policy).unwrap();
    }
}

fn projects_rows() -> Vec<Row> {
    vec![
        Row::new().with("owner_id", "u1"),
        Row::new().with("owner_id", "u2"),
    ]
}

fn owner_can_read() -> Policy {
    Policy::new("owner_can_read", "projects", Command::Select)
        .using_source("row.owner_id == claims.sub")
        .unwrap()
}

fn user(sub: &str) -> ClaimsContext {
    ClaimsContext::new(sub, "authenticated").with_claim("sub", sub)
}

#[test]
fn test_owner_can_read_scenario() {
    let ctx = TestContext::new();
    ctx.register(owner_can_read());

    let visible = ctx.gate.filter_read("projects", &user("u1"), projects_rows());
    assert_eq!(visible, vec![Row::new().with("owner_id", "u1")]);
}

#[test]
fn test_bypass_scenario() {
    let ctx = TestContext::new();
    ctx.register(owner_can_read());
    ctx.store
        .set_mode("projects", EnforcementMode::Enabled)
        .unwrap();

    let admin = user("u1").with_bypass(true);
    let visible = ctx.gate.filter_read("projects", &admin, projects_rows());
    assert_eq!(visible, projects_rows());
}

#[test]
fn test_forced_mode_applies_to_bypass_principals() {
    let ctx = TestContext::new();
    ctx.register(owner_can_read());
    ctx.store
        .set_mode("projects", EnforcementMode::Forced)
        .unwrap();

    let admin = user("u1").with_bypass(true);
    let visible = ctx.gate.filter_read("projects", &admin, projects_rows());
    assert_eq!(visible, vec![Row::new().with("owner_id", "u1")]);
}

#[test]
fn test_total_lockout_without_policies() {
    let ctx = TestContext::new();
    ctx.store
        .set_mode("projects", EnforcementMode::Enabled)
        .unwrap();
    let u1 = user("u1");

    assert!(ctx.gate.filter_read("projects", &u1, projects_rows()).is_empty());
    for command in [WriteCommand::Insert, WriteCommand::Update, WriteCommand::Delete] {
        let err = ctx
            .gate
            .authorize_write("projects", &u1, command, &projects_rows()[0])
            .unwrap_err();
        assert_eq!(err.command, Command::from(command));
    }
    for command in Command::CONCRETE {
        assert!(!ctx
            .gate
            .engine()
            .decide("projects", command, &u1, &projects_rows()[0]));
    }
    assert_eq!(ctx.store.lockouts().len(), 4);
}

#[test]
fn test_permissive_policies_combine_with_or() {
    let ctx = TestContext::new();
    ctx.register(
        Policy::new("p1", "docs", Command::Select)
            .using(Expr::lit(true)),
    );
    ctx.register(
        Policy::new("p2", "docs", Command::Select)
            .using(Expr::lit(false)),
    );

    assert!(ctx
        .gate
        .engine()
        .decide("docs", Command::Select, &user("u1"), &Row::new()));
}

#[test]
fn test_restrictive_policies_combine_with_and() {
    let ctx = TestContext::new();
    ctx.register(
        Policy::new("p1", "docs", Command::Select)
            .using(Expr::lit(true)),
    );
    ctx.register(
        Policy::new("r1", "docs", Command::Select)
            .using(Expr::lit(false))
            .restrictive(),
    );

    assert!(!ctx
        .gate
        .engine()
        .decide("docs", Command::Select, &user("u1"), &Row::new()));
}

#[test]
fn test_missing_claim_fails_closed() {
    let ctx = TestContext::new();
    ctx.register(
        Policy::new("by_email", "docs", Command::Select)
            .using_source("email = claims.profile.email")
            .unwrap(),
    );
    ctx.register(
        Policy::new("insert_by_email", "docs", Command::Insert)
            .check_source("NOT email = claims.profile.email")
            .unwrap(),
    );

    let rows = vec![Row::new().with("email", "a@b.c")];
    let u1 = user("u1");
    assert!(ctx.gate.filter_read("docs", &u1, rows.clone()).is_empty());
    assert!(ctx
        .gate
        .authorize_write("docs", &u1, WriteCommand::Insert, &rows[0])
        .is_err());
}

#[test]
fn test_filter_read_preserves_order() {
    let ctx = TestContext::new();
    ctx.register(
        Policy::new("visible", "items", Command::Select)
            .using_source("visible = true")
            .unwrap(),
    );

    let rows: Vec<Row> = (0..50i64)
        .map(|i| Row::new().with("id", i).with("visible", i % 3 != 0))
        .collect();
    let expected: Vec<Row> = rows
        .iter()
        .filter(|r| r.get("visible") == Some(&Value::Bool(true)))
        .cloned()
        .collect();

    assert_eq!(ctx.gate.filter_read("items", &user("u1"), rows), expected);
}

#[test]
fn test_policies_for_round_trip() {
    let ctx = TestContext::new();
    ctx.register(owner_can_read().for_role("authenticated"));

    let found = ctx
        .store
        .policies_for("projects", Command::Select, "authenticated");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name, "owner_can_read");

    assert!(ctx
        .store
        .policies_for("projects", Command::Select, "anon")
        .is_empty());
}

#[test]
fn test_multi_tenant_bundle() {
    let ctx = TestContext::new();
    let bundle: PolicyBundle = serde_json::from_str(
        r#"{
            "modes": {"tasks": "forced"},
            "policies": [
                {
                    "name": "team_members_read",
                    "collection": "tasks",
                    "command": "SELECT",
                    "roles": ["authenticated"],
                    "using": "team_id IN claims.app_metadata.teams"
                },
                {
                    "name": "not_deleted",
                    "collection": "tasks",
                    "command": "ALL",
                    "using": "deleted_at IS NULL",
                    "check": "deleted_at IS NULL",
                    "restrictive": true
                },
                {
                    "name": "team_members_write",
                    "collection": "tasks",
                    "command": "INSERT",
                    "roles": ["authenticated"],
                    "check": "team_id IN claims.app_metadata.teams AND created_by = auth.uid()"
                },
                {
                    "name": "assignee_update",
                    "collection": "tasks",
                    "command": "UPDATE",
                    "using": "assignee_id = auth.uid()"
                }
            ]
        }"#,
    )
    .unwrap();
    ctx.store.load_bundle(bundle).unwrap();

    let member = ClaimsContext::new("u1", "authenticated").with_claim(
        "app_metadata",
        Value::from(serde_json::json!({ "teams": ["red"] })),
    );
    let rows = vec![
        Row::new().with("id", 1).with("team_id", "red"),
        Row::new().with("id", 2).with("team_id", "blue"),
        Row::new()
            .with("id", 3)
            .with("team_id", "red")
            .with("deleted_at", "2024-01-01"),
    ];
    let visible = ctx.gate.filter_read("tasks", &member, rows);
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].get("id"), Some(&Value::Int(1)));

    let new_task = Row::new().with("team_id", "red").with("created_by", "u1");
    assert!(ctx
        .gate
        .authorize_write("tasks", &member, WriteCommand::Insert, &new_task)
        .is_ok());
    let foreign = Row::new().with("team_id", "blue").with("created_by", "u1");
    assert!(ctx
        .gate
        .authorize_write("tasks", &member, WriteCommand::Insert, &foreign)
        .is_err());

    let assigned = Row::new().with("assignee_id", "u1");
    let reassigned = Row::new().with("assignee_id", "u2");
    assert!(ctx
        .gate
        .authorize_update("tasks", &member, &assigned, &assigned)
        .is_ok());
    assert!(ctx
        .gate
        .authorize_update("tasks", &member, &assigned, &reassigned)
        .is_err());

    // Forced mode: a service principal is still subject to policy.
    let service = ClaimsContext::service("svc");
    assert!(ctx
        .gate
        .filter_read("tasks", &service, vec![Row::new().with("team_id", "red")])
        .is_empty());
}

#[test]
fn test_pushdown_agrees_with_filter() {
    let ctx = TestContext::new();
    ctx.register(owner_can_read());
    ctx.register(
        Policy::new("public", "projects", Command::Select)
            .using_source("is_public = true")
            .unwrap(),
    );

    let u1 = user("u1");
    let pushdown = ctx.gate.engine().pushdown("projects", Command::Select, &u1);
    let rows = vec![
        Row::new().with("owner_id", "u1"),
        Row::new().with("owner_id", "u2").with("is_public", true),
        Row::new().with("owner_id", "u2"),
    ];

    let pushed: Vec<Row> = rows
        .iter()
        .filter(|row| Evaluator::evaluate(&pushdown.predicate, row, &u1))
        .cloned()
        .collect();
    assert_eq!(pushed, ctx.gate.filter_read("projects", &u1, rows));
    assert!(pushdown.columns.contains("owner_id"));
    assert!(pushdown.columns.contains("is_public"));
}

#[test]
fn test_catalog_reload_restores_enforcement() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = sled::open(dir.path()).unwrap();
        let catalog = PolicyCatalog::open(&db).unwrap();
        catalog.put_policy(&owner_can_read()).unwrap();
        catalog
            .set_mode("projects", EnforcementMode::Forced)
            .unwrap();
        catalog.flush().unwrap();
    }

    let db = sled::open(dir.path()).unwrap();
    let catalog = PolicyCatalog::open(&db).unwrap();
    let ctx = TestContext::new();
    catalog.load_into(&ctx.store).unwrap();

    let admin = user("u1").with_bypass(true);
    assert_eq!(
        ctx.gate.filter_read("projects", &admin, projects_rows()).len(),
        1
    );
}

#[test]
fn test_concurrent_reads_during_registration() {
    let ctx = Arc::new(TestContext::new());
    ctx.register(owner_can_read());

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let ctx = Arc::clone(&ctx);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let visible = ctx.gate.filter_read("projects", &user("u1"), projects_rows());
                    // Extra policies only ever grant public rows, never u2's.
                    assert_eq!(visible, vec![Row::new().with("owner_id", "u1")]);
                }
            })
        })
        .collect();

    for i in 0..50 {
        ctx.register(
            Policy::new(format!("public_{}", i), "projects", Command::Select)
                .using_source("is_public = true")
                .unwrap(),
        );
    }
    for reader in readers {
        reader.join().unwrap();
    }
}
