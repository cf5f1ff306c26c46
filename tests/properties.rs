//! Property tests for exact decimals, consensus and Merkle proofs.

use intentguard::merkle::{merkle_root_hex, MerkleProof};
use intentguard::{
    check_conservation, derive_delta, Balances, Cmp, ConsensusEngine, Decimal, Expr,
    FinalDecision, Intent, Predicate, Verdict, VerifierId, DEFAULT_PRECISION,
};
use proptest::prelude::*;
use std::collections::BTreeSet;

fn decimal() -> impl Strategy<Value = Decimal> {
    (-1_000_000_000_000i64..1_000_000_000_000, 0u32..=12)
        .prop_map(|(mantissa, scale)| Decimal::from_parts(i128::from(mantissa), scale).unwrap())
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Approve,
    Reject,
    Uncertain,
}

fn verdict_for(id: VerifierId) -> impl Strategy<Value = Verdict> {
    (prop_oneof![Just(Kind::Approve), Just(Kind::Reject), Just(Kind::Uncertain)], 0.0f64..=1.0)
        .prop_map(move |(kind, confidence)| match kind {
            Kind::Approve => Verdict::approve(id, confidence, "generated"),
            Kind::Reject => Verdict::reject(id, confidence, "generated"),
            Kind::Uncertain => Verdict::uncertain(id, "generated"),
        })
}

fn verdicts() -> impl Strategy<Value = Vec<Verdict>> {
    (
        verdict_for(VerifierId::Logic),
        verdict_for(VerifierId::Conservation),
        verdict_for(VerifierId::Pattern),
    )
        .prop_map(|(a, b, c)| vec![a, b, c])
}

fn all_verifiers() -> BTreeSet<VerifierId> {
    VerifierId::ALL.into_iter().collect()
}

proptest! {
    /// Printing then parsing gives back the same value and the same text.
    #[test]
    fn prop_decimal_text_round_trips(value in decimal()) {
        let text = value.to_string();
        let parsed = Decimal::parse(&text, DEFAULT_PRECISION).unwrap();
        prop_assert_eq!(parsed, value);
        prop_assert_eq!(parsed.to_string(), text);
    }

    /// Addition and subtraction never lose a digit.
    #[test]
    fn prop_add_sub_is_exact(a in decimal(), b in decimal()) {
        let sum = a.checked_add(&b).unwrap();
        prop_assert_eq!(sum.checked_sub(&b).unwrap(), a);
        prop_assert_eq!(sum, b.checked_add(&a).unwrap());
    }

    /// Equal values hash to the same Merkle leaf regardless of scale.
    #[test]
    fn prop_merkle_root_ignores_trailing_zeros(value in decimal(), extra in 1u32..=6) {
        prop_assume!(!value.is_negative());
        let widened = Decimal::from_parts(value.mantissa() * 10i128.pow(extra), value.scale() + extra).unwrap();
        let a: Balances = [("acct".to_string(), value)].into_iter().collect();
        let b: Balances = [("acct".to_string(), widened)].into_iter().collect();
        prop_assert_eq!(merkle_root_hex(&a), merkle_root_hex(&b));
    }

    /// Every account's proof verifies against the root; a wrong balance never does.
    #[test]
    fn prop_merkle_proofs_verify(amounts in proptest::collection::vec(0u64..1_000_000, 1..24)) {
        let balances: Balances = amounts
            .iter()
            .enumerate()
            .map(|(i, &amount)| (format!("acct-{i:03}"), Decimal::from(amount as i64)))
            .collect();
        let root = merkle_root_hex(&balances);
        for account in balances.keys() {
            let mut proof = MerkleProof::build(&balances, account).unwrap();
            prop_assert!(proof.verify(&root));
            proof.balance = proof.balance.checked_add(&Decimal::from(1)).unwrap();
            prop_assert!(!proof.verify(&root));
        }
    }

    /// A confident REJECT always wins, whatever the other verifiers say.
    #[test]
    fn prop_confident_reject_always_rejects(
        mut verdicts in verdicts(),
        slot in 0usize..3,
        confidence in 0.9f64..=1.0,
    ) {
        let id = verdicts[slot].verifier_id();
        verdicts[slot] = Verdict::reject(id, confidence, "forced");
        let result = ConsensusEngine::new().aggregate(&all_verifiers(), verdicts);
        prop_assert_eq!(result.final_decision(), FinalDecision::Rejected);
    }

    /// An UNCERTAIN verdict from an activated verifier blocks approval.
    #[test]
    fn prop_uncertain_never_approves(mut verdicts in verdicts(), slot in 0usize..3) {
        let id = verdicts[slot].verifier_id();
        verdicts[slot] = Verdict::uncertain(id, "forced");
        let result = ConsensusEngine::new().aggregate(&all_verifiers(), verdicts);
        prop_assert_eq!(result.final_decision(), FinalDecision::Rejected);
    }

    /// APPROVED exactly when every activated verifier approves above threshold.
    #[test]
    fn prop_approval_requires_unanimity(verdicts in verdicts()) {
        let engine = ConsensusEngine::new();
        let threshold = engine.config().approval_threshold;
        let unanimous = verdicts
            .iter()
            .all(|v| v.decision() == intentguard::Decision::Approve && v.confidence() >= threshold);
        let result = engine.aggregate(&all_verifiers(), verdicts);
        prop_assert_eq!(result.is_approved(), unanimous);
    }

    /// Verdicts for verifiers outside the activated set cannot stand in for
    /// missing ones.
    #[test]
    fn prop_missing_verdict_rejects(confidence in 0.75f64..=1.0) {
        let verdicts = vec![
            Verdict::approve(VerifierId::Logic, confidence, "ok"),
            Verdict::approve(VerifierId::Logic, confidence, "duplicate"),
        ];
        let result = ConsensusEngine::new().aggregate(&all_verifiers(), verdicts);
        prop_assert_eq!(result.final_decision(), FinalDecision::Rejected);
        prop_assert!(result.rationale().contains("no verdict"));
    }
}

#[test]
fn test_million_small_transfers_have_zero_drift() {
    let intent = Intent::new(
        "drip",
        vec![],
        vec![
            Predicate::new(
                Expr::post_balance("alice"),
                Cmp::Eq,
                Expr::sub(Expr::balance("alice"), Expr::lit("0.00000001")),
            ),
            Predicate::new(
                Expr::post_balance("bob"),
                Cmp::Eq,
                Expr::add(Expr::balance("bob"), Expr::lit("0.00000001")),
            ),
        ],
    );
    let mut balances: Balances = [
        ("alice".to_string(), Decimal::from(1)),
        ("bob".to_string(), Decimal::ZERO),
    ]
    .into_iter()
    .collect();

    for _ in 0..1_000_000 {
        let delta = derive_delta(&intent, &balances, DEFAULT_PRECISION).unwrap();
        check_conservation(&delta).unwrap();
        for (account, change) in delta.changes {
            balances.insert(account, change.after);
        }
    }

    let cent = Decimal::parse("0.01", DEFAULT_PRECISION).unwrap();
    assert_eq!(balances["bob"], cent);
    assert_eq!(balances["alice"], Decimal::parse("0.99", DEFAULT_PRECISION).unwrap());
    assert_eq!(Decimal::try_sum(balances.values()).unwrap(), Decimal::from(1));
    assert_eq!(balances["bob"].to_string(), "0.01000000");
}
