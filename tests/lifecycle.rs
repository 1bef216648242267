//! Lifecycle transitions against a real SQLite store: winner selection, stats
//! side effects and their reversal, partial-failure tolerance, and same-row
//! serialization.

use std::sync::Arc;
use std::thread;

use chrono::{Duration, TimeZone, Utc};

use tourney::clock::ManualClock;
use tourney::lifecycle::EffectOutcome;
use tourney::stats::StatsOp;
use tourney::{EngineError, Lifecycle, NewCompetition, ParticipantStats, ScoreLedger, Status, Store};

struct Fixture {
    store: Arc<Store>,
    clock: Arc<ManualClock>,
    lifecycle: Arc<Lifecycle>,
    ledger: ScoreLedger,
}

fn fixture() -> Fixture {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
    let lifecycle = Arc::new(Lifecycle::new(store.clone(), clock.clone()));
    let ledger = ScoreLedger::new(store.clone(), clock.clone(), 50);
    Fixture { store, clock, lifecycle, ledger }
}

impl Fixture {
    fn competition(&self, id: &str, scores: &[(&str, f64)]) {
        self.store
            .create_competition(&NewCompetition {
                id: id.to_string(),
                name: format!("Competition {}", id),
                scheduled_start: self.clock_now() + Duration::days(1),
            })
            .unwrap();
        for (pid, score) in scores {
            self.store.add_participant(pid, pid).unwrap();
            self.store.register(pid, id).unwrap();
            self.ledger.set_score(pid, id, *score).unwrap();
        }
    }

    fn clock_now(&self) -> chrono::DateTime<Utc> {
        use tourney::Clock;
        self.clock.now()
    }

    fn stats(&self, pid: &str) -> ParticipantStats {
        self.store.stats(pid).unwrap().unwrap_or_else(|| ParticipantStats {
            participant_id: pid.to_string(),
            ..Default::default()
        })
    }
}

#[test]
fn finishing_ranks_top_three_positive_scores() {
    let f = fixture();
    f.competition("c1", &[("p10", 10.0), ("p30", 30.0), ("p20", 20.0), ("p5", 5.0), ("p0", 0.0)]);
    f.lifecycle.transition("c1", Status::InProgress).unwrap();

    let report = f.lifecycle.transition("c1", Status::Finished).unwrap();
    assert!(report.changed);
    let podium: Vec<_> = report.winners.iter().map(|w| (w.position, w.participant_id.as_str())).collect();
    assert_eq!(podium, vec![(1, "p30"), (2, "p20"), (3, "p10")]);

    let comp = f.store.competition("c1").unwrap();
    assert_eq!(comp.status, Status::Finished);
    assert_eq!(comp.winners, report.winners);

    // the zero scorer is not a winner but still played
    assert_eq!(f.stats("p0").matches_played, 1);
    assert_eq!(f.stats("p0").wins, 0);
    assert_eq!(f.stats("p30").wins_first, 1);
    assert_eq!(f.stats("p20").wins_second, 1);
    assert_eq!(f.stats("p10").wins_third, 1);
    assert_eq!(f.stats("p5").wins, 0);
    for pid in ["p10", "p30", "p20", "p5", "p0"] {
        assert_eq!(f.stats(pid).matches_played, 1, "{}", pid);
    }
}

#[test]
fn finish_then_revert_restores_prior_stats() {
    let f = fixture();
    // baseline stats from an earlier competition
    f.competition("c0", &[("a", 3.0), ("b", 2.0), ("c", 1.0)]);
    f.lifecycle.transition("c0", Status::InProgress).unwrap();
    f.lifecycle.transition("c0", Status::Finished).unwrap();

    f.competition("c1", &[("a", 1.0), ("b", 9.0), ("c", 4.0)]);
    f.lifecycle.transition("c1", Status::InProgress).unwrap();
    let before: Vec<_> = ["a", "b", "c"].iter().map(|p| f.stats(p)).collect();

    f.lifecycle.transition("c1", Status::Finished).unwrap();
    assert_ne!(f.stats("b"), before[1]);

    let report = f.lifecycle.transition("c1", Status::InProgress).unwrap();
    assert!(report.changed);
    assert_eq!(report.skipped().count(), 0);
    let after: Vec<_> = ["a", "b", "c"].iter().map(|p| f.stats(p)).collect();
    assert_eq!(before, after);

    let comp = f.store.competition("c1").unwrap();
    assert!(comp.winners.is_empty());
    assert!(comp.started_at.is_some());
}

#[test]
fn reverting_finished_claws_back_awarded_currency() {
    let f = fixture();
    f.competition("c1", &[("gold", 50.0), ("silver", 40.0)]);
    f.lifecycle.transition("c1", Status::InProgress).unwrap();
    f.lifecycle.transition("c1", Status::Finished).unwrap();

    let w = f.lifecycle.assign_award("c1", 1, 100).unwrap();
    assert_eq!(w.participant_id, "gold");
    assert_eq!(f.stats("gold").currency_balance, 100);
    assert_eq!(f.store.competition("c1").unwrap().winner_at(1).unwrap().award, 100);

    let before = f.stats("gold");
    let report = f.lifecycle.transition("c1", Status::Registration).unwrap();
    let after = f.stats("gold");
    assert_eq!(before.currency_balance - after.currency_balance, 100);
    assert_eq!(before.wins_first - after.wins_first, 1);
    assert_eq!(before.wins - after.wins, 1);
    assert!(report
        .side_effects
        .iter()
        .any(|e| e.op == StatsOp::RevertCurrency { amount: 100 } && e.outcome == EffectOutcome::Applied));
    // silver had no award, so no currency revert for them
    assert!(!report
        .side_effects
        .iter()
        .any(|e| e.participant_id == "silver" && matches!(e.op, StatsOp::RevertCurrency { .. })));
}

#[test]
fn reassigning_award_moves_balance_by_difference() {
    let f = fixture();
    f.competition("c1", &[("a", 5.0)]);
    f.lifecycle.transition("c1", Status::InProgress).unwrap();
    f.lifecycle.transition("c1", Status::Finished).unwrap();
    f.lifecycle.assign_award("c1", 1, 100).unwrap();
    f.lifecycle.assign_award("c1", 1, 60).unwrap();
    assert_eq!(f.stats("a").currency_balance, 60);

    assert!(matches!(f.lifecycle.assign_award("c1", 2, 10), Err(EngineError::NotFound { .. })));
    assert!(matches!(f.lifecycle.assign_award("c1", 1, -5), Err(EngineError::InvalidAward(-5))));
}

#[test]
fn award_requires_finished_competition() {
    let f = fixture();
    f.competition("c1", &[("a", 5.0)]);
    let err = f.lifecycle.assign_award("c1", 1, 10).unwrap_err();
    assert!(matches!(err, EngineError::WrongStatus { status: Status::Registration, .. }));
}

#[test]
fn missing_participant_is_skipped_not_fatal() {
    let f = fixture();
    f.competition("c1", &[("a", 5.0), ("gone", 9.0), ("c", 1.0)]);
    f.lifecycle.transition("c1", Status::InProgress).unwrap();
    // participant row vanishes while its registration is still in place
    f.store
        .read(|conn| {
            conn.execute("DELETE FROM participants WHERE id = 'gone'", [])?;
            Ok(())
        })
        .unwrap();

    let report = f.lifecycle.transition("c1", Status::Finished).unwrap();
    assert_eq!(f.store.competition("c1").unwrap().status, Status::Finished);

    let skipped: Vec<_> = report.skipped().map(|e| (e.participant_id.as_str(), e.op)).collect();
    assert_eq!(
        skipped,
        vec![("gone", StatsOp::RecordMatchPlayed), ("gone", StatsOp::RecordWin { position: 1 })]
    );
    assert_eq!(f.stats("a").matches_played, 1);
    assert_eq!(f.stats("a").wins_second, 1);
    assert_eq!(f.stats("c").wins_third, 1);
    assert!(f.store.stats("gone").unwrap().is_none());
    assert!(report.message().contains("2 stats update(s) skipped"));
}

#[test]
fn removed_participant_cannot_take_a_podium_spot() {
    let f = fixture();
    f.competition("c1", &[("p1", 10.0), ("p2", 3.0)]);
    f.lifecycle.transition("c1", Status::InProgress).unwrap();
    assert_eq!(f.store.remove_participant("p1").unwrap(), 1);

    let ids: Vec<_> = f.store.registrations("c1").unwrap().into_iter().map(|r| r.participant_id).collect();
    assert_eq!(ids, vec!["p2".to_string()]);

    let report = f.lifecycle.transition("c1", Status::Finished).unwrap();
    let podium: Vec<_> = report.winners.iter().map(|w| (w.position, w.participant_id.as_str())).collect();
    assert_eq!(podium, vec![(1, "p2")]);
    assert_eq!(report.skipped().count(), 0);
    assert_eq!(f.stats("p2").wins_first, 1);
    assert!(f.store.stats("p1").unwrap().is_none());
}

#[test]
fn leaving_finished_clears_result_photos() {
    let f = fixture();
    f.competition("c1", &[("a", 5.0)]);
    f.lifecycle.transition("c1", Status::InProgress).unwrap();
    assert!(f.lifecycle.set_result_photos("c1", &["podium.jpg".to_string()]).is_err());
    f.lifecycle.transition("c1", Status::Finished).unwrap();
    f.lifecycle.set_result_photos("c1", &["podium.jpg".to_string()]).unwrap();
    assert_eq!(f.store.competition("c1").unwrap().result_photos, vec!["podium.jpg".to_string()]);

    f.lifecycle.transition("c1", Status::InProgress).unwrap();
    assert!(f.store.competition("c1").unwrap().result_photos.is_empty());
}

#[test]
fn started_at_tracks_first_entry_into_progress() {
    let f = fixture();
    f.competition("c1", &[]);
    f.competition("c2", &[]);

    f.lifecycle.transition("c2", Status::Cancelled).unwrap();
    assert!(f.store.competition("c2").unwrap().started_at.is_none());

    let t0 = f.clock_now();
    f.lifecycle.transition("c1", Status::InProgress).unwrap();
    f.clock.advance(Duration::hours(1));
    f.lifecycle.transition("c1", Status::Registration).unwrap();
    f.lifecycle.transition("c1", Status::InProgress).unwrap();
    let comp = f.store.competition("c1").unwrap();
    assert_eq!(comp.started_at, Some(t0));
    assert!(!comp.auto_started);
}

#[test]
fn same_status_is_a_no_change_result() {
    let f = fixture();
    f.competition("c1", &[("a", 1.0)]);
    let report = f.lifecycle.transition("c1", Status::Registration).unwrap();
    assert!(!report.changed);
    assert!(report.side_effects.is_empty());
    assert_eq!(report.message(), "competition c1 is already REGISTRATION");
}

#[test]
fn disallowed_transitions_leave_state_untouched() {
    let f = fixture();
    f.competition("c1", &[("a", 1.0)]);
    f.lifecycle.transition("c1", Status::InProgress).unwrap();
    f.lifecycle.transition("c1", Status::Finished).unwrap();
    let err = f.lifecycle.transition("c1", Status::Cancelled).unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition { from: Status::Finished, to: Status::Cancelled }
    ));
    assert_eq!(f.store.competition("c1").unwrap().status, Status::Finished);
    assert_eq!(f.stats("a").matches_played, 1);

    assert!(matches!(
        f.lifecycle.transition("missing", Status::InProgress),
        Err(EngineError::NotFound { kind: "competition", .. })
    ));
}

#[test]
fn finishing_straight_from_registration_or_cancelled_sets_started_at() {
    let f = fixture();
    f.competition("c1", &[("a", 4.0), ("b", 2.0)]);
    f.competition("c2", &[("b", 6.0)]);
    let now = f.clock_now();

    let report = f.lifecycle.transition("c1", Status::Finished).unwrap();
    assert_eq!(report.from, Status::Registration);
    assert_eq!(report.winners.len(), 2);
    let c1 = f.store.competition("c1").unwrap();
    assert_eq!(c1.status, Status::Finished);
    assert_eq!(c1.started_at, Some(now));
    assert!(!c1.auto_started);

    f.lifecycle.transition("c2", Status::Cancelled).unwrap();
    f.clock.advance(Duration::minutes(30));
    f.lifecycle.transition("c2", Status::Finished).unwrap();
    assert_eq!(f.store.competition("c2").unwrap().started_at, Some(now + Duration::minutes(30)));

    assert_eq!(f.stats("a").wins_first, 1);
    assert_eq!(f.stats("b").matches_played, 2);
    assert_eq!(f.stats("b").wins, 2);
}

#[test]
fn concurrent_finishes_apply_once() {
    let f = fixture();
    f.competition("c1", &[("a", 3.0), ("b", 2.0)]);
    f.lifecycle.transition("c1", Status::InProgress).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let lc = f.lifecycle.clone();
            thread::spawn(move || lc.transition("c1", Status::Finished).unwrap())
        })
        .collect();
    let changed = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|r| r.changed)
        .count();

    assert_eq!(changed, 1);
    assert_eq!(f.stats("a").matches_played, 1);
    assert_eq!(f.stats("a").wins_first, 1);
    assert_eq!(f.stats("b").matches_played, 1);
}

#[test]
fn file_backed_store_persists_outcome() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("tourney.sqlite");
    let path = path.to_str().unwrap();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));

    {
        let store = Arc::new(Store::open(path, std::time::Duration::from_secs(1)).unwrap());
        store.init().unwrap();
        store
            .create_competition(&NewCompetition {
                id: "c1".to_string(),
                name: "Persisted".to_string(),
                scheduled_start: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            })
            .unwrap();
        store.add_participant("a", "A").unwrap();
        store.register("a", "c1").unwrap();
        let ledger = ScoreLedger::new(store.clone(), clock.clone(), 50);
        ledger.set_score("a", "c1", 7.0).unwrap();
        let lifecycle = Lifecycle::new(store, clock.clone());
        lifecycle.transition("c1", Status::InProgress).unwrap();
        lifecycle.transition("c1", Status::Finished).unwrap();
    }

    let store = Store::open(path, std::time::Duration::from_secs(1)).unwrap();
    store.init().unwrap();
    let comp = store.competition("c1").unwrap();
    assert_eq!(comp.status, Status::Finished);
    assert_eq!(comp.winners.len(), 1);
    assert_eq!(store.registration("a", "c1").unwrap().history.len(), 1);
    assert_eq!(store.stats("a").unwrap().unwrap().matches_played, 1);
}
