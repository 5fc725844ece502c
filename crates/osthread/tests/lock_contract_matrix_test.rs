use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use osthread::{Fault, LockOp, LockState, lock_transition};

#[derive(Clone, Copy)]
struct Case {
    old_state: LockState,
    op: LockOp,
    expected_state: LockState,
    expected_blocks: bool,
    expected_acquires: bool,
    expected_fault: Option<Fault>,
}

fn workspace_root() -> PathBuf {
    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest.parent().unwrap().parent().unwrap().to_path_buf()
}

fn state_name(state: LockState) -> &'static str {
    match state {
        LockState::Unlocked => "Unlocked",
        LockState::HeldBySelf => "HeldBySelf",
        LockState::HeldByOther => "HeldByOther",
    }
}

fn op_name(op: LockOp) -> &'static str {
    match op {
        LockOp::Acquire => "Acquire",
        LockOp::TryAcquire => "TryAcquire",
        LockOp::Release => "Release",
        LockOp::Wait => "Wait",
        LockOp::Notify => "Notify",
    }
}

fn fault_name(fault: Option<Fault>) -> &'static str {
    fault.map_or("none", Fault::name)
}

const fn case(
    old_state: LockState,
    op: LockOp,
    expected_state: LockState,
    expected_blocks: bool,
    expected_acquires: bool,
    expected_fault: Option<Fault>,
) -> Case {
    Case {
        old_state,
        op,
        expected_state,
        expected_blocks,
        expected_acquires,
        expected_fault,
    }
}

fn matrix_cases() -> Vec<Case> {
    use LockOp::*;
    use LockState::*;

    vec![
        case(Unlocked, Acquire, HeldBySelf, false, true, None),
        case(Unlocked, TryAcquire, HeldBySelf, false, true, None),
        case(Unlocked, Release, Unlocked, false, false, Some(Fault::ReleaseNotOwner)),
        case(Unlocked, Wait, Unlocked, false, false, Some(Fault::WaitWithoutLock)),
        case(Unlocked, Notify, Unlocked, false, false, Some(Fault::NotifyWithoutLock)),
        case(HeldBySelf, Acquire, HeldBySelf, false, false, Some(Fault::RecursiveAcquire)),
        case(HeldBySelf, TryAcquire, HeldBySelf, false, false, None),
        case(HeldBySelf, Release, Unlocked, false, false, None),
        case(HeldBySelf, Wait, HeldBySelf, true, false, None),
        case(HeldBySelf, Notify, HeldBySelf, false, false, None),
        case(HeldByOther, Acquire, HeldBySelf, true, true, None),
        case(HeldByOther, TryAcquire, HeldByOther, false, false, None),
        case(HeldByOther, Release, HeldByOther, false, false, Some(Fault::ReleaseNotOwner)),
        case(HeldByOther, Wait, HeldByOther, false, false, Some(Fault::WaitWithoutLock)),
        case(HeldByOther, Notify, HeldByOther, false, false, Some(Fault::NotifyWithoutLock)),
    ]
}

#[test]
fn matrix_covers_every_state_and_op() {
    let cases = matrix_cases();
    for state in [LockState::Unlocked, LockState::HeldBySelf, LockState::HeldByOther] {
        for op in [
            LockOp::Acquire,
            LockOp::TryAcquire,
            LockOp::Release,
            LockOp::Wait,
            LockOp::Notify,
        ] {
            assert!(
                cases.iter().any(|c| c.old_state == state && c.op == op),
                "missing case {}/{}",
                state_name(state),
                op_name(op)
            );
        }
    }
}

#[test]
fn contract_matrix_matches_expected_and_emits_structured_logs() {
    let root = workspace_root();
    let out_dir = root.join("target/conformance");
    fs::create_dir_all(&out_dir).expect("create target/conformance");

    let log_path = out_dir.join("lock_contract_matrix.log.jsonl");
    let report_path = out_dir.join("lock_contract_matrix.report.json");

    let mut log_lines = Vec::new();
    let mut mismatches = Vec::new();
    let mut passed = 0usize;
    let cases = matrix_cases();

    for case in &cases {
        let t0 = Instant::now();
        let got = lock_transition(case.old_state, case.op);
        let timing_ns = t0.elapsed().as_nanos();

        let ok = got.next == case.expected_state
            && got.blocks == case.expected_blocks
            && got.acquires == case.expected_acquires
            && got.fault == case.expected_fault;
        if ok {
            passed += 1;
        } else {
            mismatches.push(format!(
                "{}:{} expected(next={}, blocks={}, fault={}) got(next={}, blocks={}, fault={})",
                state_name(case.old_state),
                op_name(case.op),
                state_name(case.expected_state),
                case.expected_blocks,
                fault_name(case.expected_fault),
                state_name(got.next),
                got.blocks,
                fault_name(got.fault),
            ));
        }

        log_lines.push(
            serde_json::json!({
                "trace_id": format!(
                    "lock-contract:{}:{}",
                    state_name(case.old_state),
                    op_name(case.op)
                ),
                "backend": osthread::backend_name(),
                "operation": op_name(case.op),
                "old_state": state_name(case.old_state),
                "new_state": state_name(got.next),
                "blocks": got.blocks,
                "acquires": got.acquires,
                "fault": fault_name(got.fault),
                "timing_ns": timing_ns as u64,
                "status": if ok { "ok" } else { "mismatch" },
            })
            .to_string(),
        );
    }

    fs::write(&log_path, format!("{}\n", log_lines.join("\n"))).expect("write jsonl log");

    let report = serde_json::json!({
        "ok": mismatches.is_empty(),
        "total_cases": cases.len(),
        "passed_cases": passed,
        "failed_cases": cases.len() - passed,
        "log_jsonl": log_path
            .strip_prefix(&root)
            .unwrap_or(&log_path)
            .to_string_lossy(),
        "mismatches": mismatches,
    });
    fs::write(
        &report_path,
        serde_json::to_string_pretty(&report).expect("serialize report"),
    )
    .expect("write report json");

    assert!(
        mismatches.is_empty(),
        "contract matrix mismatch(es): {mismatches:?}"
    );
}
