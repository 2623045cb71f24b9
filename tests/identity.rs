use chrono::{NaiveDate, TimeZone, Utc};
use rusqlite::{Connection, TransactionBehavior};
use serde_json::json;

use playerfouls::ReconcileError;
use playerfouls::config::ReconcileConfig;
use playerfouls::fields::Source;
use playerfouls::identity::{
    IdentityKind, MatchDescriptor, PlayerDescriptor, resolve_match, resolve_player,
};
use playerfouls::pipeline::{KeyLocks, ingest_record, replay_review, resolve_identities};
use playerfouls::record::SourceRecord;
use playerfouls::review::{ReviewResolution, list_open_reviews, resolve_review};
use playerfouls::store;

fn lorient_away() -> MatchDescriptor {
    MatchDescriptor::new(
        NaiveDate::from_ymd_opt(2023, 4, 30).unwrap(),
        "Paris S-G",
        "Lorient",
    )
}

fn sighting(source: Source, name: &str) -> SourceRecord {
    SourceRecord::new(
        source,
        PlayerDescriptor::named(name),
        lorient_away(),
        Utc.with_ymd_and_hms(2023, 5, 2, 10, 0, 0).unwrap(),
    )
}

fn player_id(conn: &mut Connection, source: Source, name: &str) -> String {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .unwrap();
    let id = resolve_player(&tx, source, &PlayerDescriptor::named(name), 0.90).unwrap();
    tx.commit().unwrap();
    id
}

fn player_count(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM players", [], |row| row.get(0))
        .unwrap()
}

#[test]
fn spelling_variants_collapse_to_one_player() {
    let mut conn = store::open_memory_db().unwrap();
    let a = player_id(&mut conn, Source::Fbref, "Kylian Mbappé");
    let b = player_id(&mut conn, Source::Sofascore, "KYLIAN  MBAPPE");
    let c = player_id(&mut conn, Source::Whoscored, "K. Mbappe");
    assert_eq!(a, b);
    assert_eq!(a, c);
    assert_eq!(player_count(&conn), 1);
}

#[test]
fn shared_surname_does_not_collapse() {
    let mut conn = store::open_memory_db().unwrap();
    let bernardo = player_id(&mut conn, Source::Fbref, "Bernardo Silva");
    let thiago = player_id(&mut conn, Source::Fbref, "Thiago Silva");
    assert_ne!(bernardo, thiago);
    assert_eq!(player_count(&conn), 2);
}

#[test]
fn initial_alias_does_not_pull_in_a_different_given_name() {
    let mut conn = store::open_memory_db().unwrap();
    let short = player_id(&mut conn, Source::Fbref, "L. Messi");
    let lionel = player_id(&mut conn, Source::Sofascore, "Lionel Messi");
    let lucas = player_id(&mut conn, Source::Whoscored, "Lucas Messi");
    assert_eq!(lionel, short);
    assert_ne!(lucas, lionel);
    assert_eq!(player_count(&conn), 2);

    // The known initial still lands on the first player by exact alias.
    assert_eq!(player_id(&mut conn, Source::Whoscored, "L. Messi"), lionel);
}

#[test]
fn source_id_resolves_even_when_the_name_changes() {
    let mut conn = store::open_memory_db().unwrap();
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .unwrap();
    let short = PlayerDescriptor {
        name: "L. Messi".to_string(),
        source_id: Some("d70ce98e".to_string()),
        team: Some("Paris S-G".to_string()),
    };
    let full = PlayerDescriptor {
        name: "Lionel Andrés Messi Cuccittini".to_string(),
        source_id: Some("d70ce98e".to_string()),
        team: Some("Inter Miami".to_string()),
    };
    let a = resolve_player(&tx, Source::Fbref, &short, 0.90).unwrap();
    let b = resolve_player(&tx, Source::Fbref, &full, 0.90).unwrap();
    tx.commit().unwrap();
    assert_eq!(a, b);

    let team: String = conn
        .query_row(
            "SELECT current_team FROM players WHERE player_id = ?1",
            [&a],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(team, "Inter Miami");
}

#[test]
fn ambiguous_name_is_queued_then_resolved_and_replayed() {
    let mut conn = store::open_memory_db().unwrap();
    let config = ReconcileConfig::default();
    let bernardo = player_id(&mut conn, Source::Fbref, "Bernardo Silva");
    let bruno = player_id(&mut conn, Source::Fbref, "Bruno Silva");

    let record = sighting(Source::Fbref, "B. Silva").with_field("fouls", json!(2));
    let err = ingest_record(&mut conn, &config, &record, &KeyLocks::default()).unwrap_err();
    let ReconcileError::AmbiguousIdentity {
        kind,
        candidates,
        review_id: Some(review_id),
        ..
    } = &err
    else {
        panic!("expected a queued ambiguity, got {err}");
    };
    assert_eq!(*kind, IdentityKind::Player);
    assert!(candidates.contains(&bernardo) && candidates.contains(&bruno));
    assert_eq!(store::count_records(&conn).unwrap(), 0);

    // Seeing it again reuses the open review.
    let again = ingest_record(&mut conn, &config, &record, &KeyLocks::default()).unwrap_err();
    assert_eq!(again.review_id(), Some(*review_id));

    let open = list_open_reviews(&conn).unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].record.as_ref(), Some(&record));

    let resolved = resolve_review(
        &mut conn,
        *review_id,
        &ReviewResolution::Existing(bernardo.clone()),
    )
    .unwrap();
    assert_eq!(resolved.resolved_id.as_deref(), Some(bernardo.as_str()));
    assert!(list_open_reviews(&conn).unwrap().is_empty());

    let outcome = replay_review(&mut conn, &config, *review_id)
        .unwrap()
        .expect("parked record is replayed");
    assert_eq!(outcome.key.player_id, bernardo);
    assert_eq!(outcome.report.present, 1);

    // Later sightings follow the decision instead of reopening the question.
    let later = sighting(Source::Fbref, "B. Silva").with_field("fouls", json!(3));
    let key = resolve_identities(&mut conn, &config, &later).unwrap();
    assert_eq!(key.player_id, bernardo);
}

#[test]
fn review_can_split_off_a_new_player() {
    let mut conn = store::open_memory_db().unwrap();
    let config = ReconcileConfig::default();
    player_id(&mut conn, Source::Fbref, "Bernardo Silva");
    player_id(&mut conn, Source::Fbref, "Bruno Silva");

    let record = sighting(Source::Sofascore, "B. Silva");
    let review_id = resolve_identities(&mut conn, &config, &record)
        .unwrap_err()
        .review_id()
        .unwrap();
    let resolved = resolve_review(&mut conn, review_id, &ReviewResolution::NewIdentity).unwrap();
    assert_eq!(player_count(&conn), 3);
    assert!(resolved.resolved_id.unwrap().starts_with("pl-"));

    let err = resolve_review(&mut conn, review_id, &ReviewResolution::NewIdentity).unwrap_err();
    assert!(matches!(err, ReconcileError::IdentityResolution(_)));
}

#[test]
fn resolving_to_an_unknown_identity_fails() {
    let mut conn = store::open_memory_db().unwrap();
    let config = ReconcileConfig::default();
    player_id(&mut conn, Source::Fbref, "Bernardo Silva");
    player_id(&mut conn, Source::Fbref, "Bruno Silva");
    let review_id = resolve_identities(&mut conn, &config, &sighting(Source::Fbref, "B. Silva"))
        .unwrap_err()
        .review_id()
        .unwrap();

    let err = resolve_review(
        &mut conn,
        review_id,
        &ReviewResolution::Existing("pl-0000000000000000".to_string()),
    )
    .unwrap_err();
    assert!(matches!(err, ReconcileError::IdentityResolution(_)));
    assert_eq!(list_open_reviews(&conn).unwrap().len(), 1);
}

#[test]
fn missing_name_or_date_fails_without_side_effects() {
    let mut conn = store::open_memory_db().unwrap();
    let config = ReconcileConfig::default();

    let nameless = sighting(Source::Fbref, "  ");
    let err = resolve_identities(&mut conn, &config, &nameless).unwrap_err();
    assert!(matches!(err, ReconcileError::IdentityResolution(_)));

    let mut undated = sighting(Source::Fbref, "Achraf Hakimi");
    undated.match_info.date = None;
    let err = resolve_identities(&mut conn, &config, &undated).unwrap_err();
    assert!(matches!(err, ReconcileError::IdentityResolution(_)));

    assert_eq!(player_count(&conn), 0, "a failed resolution leaves no identity behind");
}

#[test]
fn home_and_away_swapped_is_the_same_match() {
    let mut conn = store::open_memory_db().unwrap();
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .unwrap();
    let date = NaiveDate::from_ymd_opt(2023, 4, 30).unwrap();
    let a = resolve_match(
        &tx,
        Source::Fbref,
        &MatchDescriptor::new(date, "Paris S-G", "Lorient"),
        0.90,
    )
    .unwrap();
    let b = resolve_match(
        &tx,
        Source::Whoscored,
        &MatchDescriptor::new(date, "Lorient", "Paris S.G."),
        0.90,
    )
    .unwrap();
    assert_eq!(a.match_id, b.match_id);

    let next_day = resolve_match(
        &tx,
        Source::Fbref,
        &MatchDescriptor::new(date.succ_opt().unwrap(), "Paris S-G", "Lorient"),
        0.90,
    )
    .unwrap();
    assert_ne!(a.match_id, next_day.match_id);
}

#[test]
fn similar_club_names_stay_distinct_teams() {
    let mut conn = store::open_memory_db().unwrap();
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .unwrap();
    let date = NaiveDate::from_ymd_opt(2023, 3, 5).unwrap();
    let derby = resolve_match(
        &tx,
        Source::Fbref,
        &MatchDescriptor::new(date, "Manchester City", "Manchester United"),
        0.90,
    )
    .unwrap();
    assert_ne!(derby.home_team_id, derby.away_team_id);

    let err = resolve_match(
        &tx,
        Source::Fbref,
        &MatchDescriptor::new(date, "Lorient", "LORIENT"),
        0.90,
    )
    .unwrap_err();
    assert!(matches!(err, ReconcileError::IdentityResolution(_)));
}

#[test]
fn club_abbreviations_resolve_to_one_team() {
    let mut conn = store::open_memory_db().unwrap();
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .unwrap();
    let date = NaiveDate::from_ymd_opt(2023, 4, 30).unwrap();
    let ids: Vec<String> = ["PSG", "Paris S-G", "Paris Saint-Germain"]
        .into_iter()
        .map(|home| {
            resolve_match(
                &tx,
                Source::Fbref,
                &MatchDescriptor::new(date, home, "Lorient"),
                0.90,
            )
            .unwrap()
            .match_id
        })
        .collect();
    tx.commit().unwrap();

    assert!(ids.iter().all(|id| *id == ids[0]), "{ids:?}");
    let teams: i64 = conn
        .query_row("SELECT COUNT(*) FROM teams", [], |row| row.get(0))
        .unwrap();
    assert_eq!(teams, 2);
}
