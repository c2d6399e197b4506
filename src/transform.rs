//! Operational transform: the pairwise `transform` contract and the batch
//! fold used when a new client operation is reconciled against a window of
//! recent server history.
//!
//! `transform(client, server) -> client'` assumes `server` is already part of
//! authoritative history. The result must preserve TP1 convergence: applying
//! `server` then `client'` reaches the same text as applying `client` then
//! `server` transformed against `client`.

use crate::operation::{OpKind, Operation, Payload};

/// Priority rule: server wins the tie-break when its clock is numerically
/// smaller, or (on equal clocks) its site id is smaller, or (on equal sites)
/// its wall time is smaller. "Wins" means the other operation is the one
/// that gets shifted past it.
fn server_wins(client: &Operation, server: &Operation) -> bool {
    if server.logical_clock != client.logical_clock {
        return server.logical_clock < client.logical_clock;
    }
    if server.site_id != client.site_id {
        return server.site_id < client.site_id;
    }
    server.wall_time < client.wall_time
}

/// Transforms `client` against `server`, which is assumed to already be part
/// of authoritative history.
pub fn transform(client: &Operation, server: &Operation) -> Operation {
    if client.author == server.author {
        return client.clone();
    }

    match (client.kind, server.kind) {
        (OpKind::Insert, OpKind::Insert) => transform_insert_insert(client, server),
        (OpKind::Insert, OpKind::Delete) => transform_insert_delete(client, server),
        (OpKind::Delete, OpKind::Insert) => transform_delete_insert(client, server),
        (OpKind::Delete, OpKind::Delete) => transform_delete_delete(client, server),
    }
}

fn transform_insert_insert(client: &Operation, server: &Operation) -> Operation {
    let server_len = server.payload_length();
    let (cp, sp) = (client.position, server.position);

    if sp < cp {
        client.with_position(cp + server_len)
    } else if sp > cp {
        client.clone()
    } else if server_wins(client, server) {
        client.with_position(cp + server_len)
    } else {
        client.clone()
    }
}

fn transform_insert_delete(client: &Operation, server: &Operation) -> Operation {
    let cp = client.position;
    let sp = server.position;
    let sl = server.payload_length();

    if cp <= sp {
        client.clone()
    } else if cp >= sp + sl {
        client.with_position(cp - sl)
    } else {
        client.with_position(sp)
    }
}

fn transform_delete_insert(client: &Operation, server: &Operation) -> Operation {
    let cp = client.position;
    let cl = client
        .length()
        .expect("DELETE operation must carry a length payload");
    let q = server.position;
    let insert_len = server.payload_length();

    if q <= cp {
        client.with_position(cp + insert_len)
    } else if q >= cp + cl {
        client.clone()
    } else {
        client.with_length(cl + insert_len)
    }
}

fn transform_delete_delete(client: &Operation, server: &Operation) -> Operation {
    let cp = client.position;
    let cl = client
        .length()
        .expect("DELETE operation must carry a length payload");
    let sp = server.position;
    let sl = server.payload_length();

    if sp + sl <= cp {
        // server entirely precedes client
        return client.with_position(cp - sl);
    }
    if sp >= cp + cl {
        // server entirely follows client
        return client.clone();
    }

    let overlap = min(cp + cl, sp + sl) - max(cp, sp);
    if overlap >= cl {
        // client's range is fully subsumed by the server's deletion
        return client.with_length(0);
    }
    if cp < sp {
        client.with_length(sp - cp)
    } else {
        client.with_position(sp).with_length(cl - overlap)
    }
}

fn min(a: u32, b: u32) -> u32 {
    if a < b { a } else { b }
}

fn max(a: u32, b: u32) -> u32 {
    if a > b { a } else { b }
}

/// Folds `client` through every operation in `server_ops` (assumed already
/// sorted by `logical_clock`), returning `None` if the fold produces a
/// zero-length DELETE (the engine discards those).
pub fn transform_against(client: Operation, server_ops: &[Operation]) -> Option<Operation> {
    let mut current = client;
    for server_op in server_ops {
        current = transform(&current, server_op);
        if current.is_delete() && current.length() == Some(0) {
            return None;
        }
    }
    Some(current)
}

/// Batch transform: sorts `server_ops` by clock, then folds each client op
/// through every server op in turn. Transformed client ops are appended to a
/// local copy of the server history as they're produced, so later client ops
/// in the same batch see earlier ones in the batch.
pub fn transform_batch(client_ops: Vec<Operation>, server_ops: &[Operation]) -> Vec<Operation> {
    let mut history: Vec<Operation> = server_ops.to_vec();
    history.sort_by_key(|op| op.logical_clock);

    let mut result = Vec::with_capacity(client_ops.len());
    for client_op in client_ops {
        if let Some(transformed) = transform_against(client_op, &history) {
            history.push(transformed.clone());
            result.push(transformed);
        }
    }
    result
}

/// Applies `op` to `content` (indexed by Unicode scalar value, not byte
/// offset). INSERT clamps `position` into `[0, len]` so a stale client
/// position is repaired rather than rejected. DELETE rejects out-of-range
/// ranges and non-positive lengths outright — the caller is expected to have
/// already clamped those via [`crate::document::Document`].
pub fn apply(content: &str, op: &Operation) -> Result<String, String> {
    let chars: Vec<char> = content.chars().collect();
    let len = chars.len() as u32;

    match &op.payload {
        Payload::Text(text) => {
            let position = op.position.min(len) as usize;
            let mut result = String::with_capacity(content.len() + text.len());
            result.extend(chars[..position].iter());
            result.push_str(text);
            result.extend(chars[position..].iter());
            Ok(result)
        }
        Payload::Len(length) => {
            let position = op.position;
            if position > len || length == &0 || position + *length > len {
                return Err(format!(
                    "delete range [{position}, {}) out of bounds for length {len}",
                    position + *length
                ));
            }
            let (start, end) = (position as usize, (position + *length) as usize);
            let mut result = String::with_capacity(content.len());
            result.extend(chars[..start].iter());
            result.extend(chars[end..].iter());
            Ok(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author(name: &str) -> String {
        name.to_string()
    }

    #[test]
    fn identity_rule_same_author() {
        let a = Operation::insert(3, "x".into(), author("alice"));
        let b = Operation::insert(0, "y".into(), author("alice"));
        let transformed = transform(&a, &b);
        assert_eq!(transformed, a);
    }

    #[test]
    fn insert_insert_shifts_right_when_server_precedes() {
        let client = Operation::insert(5, "Y".into(), author("b"));
        let server = Operation::insert(0, "X".into(), author("a"));
        let transformed = transform(&client, &server);
        assert_eq!(transformed.position, 6);
    }

    #[test]
    fn insert_insert_tie_break_by_clock() {
        // server (clock 1) wins over client (clock 2): client shifts right.
        let server = Operation {
            logical_clock: 1,
            ..Operation::insert(1, "P".into(), author("a"))
        };
        let client = Operation {
            logical_clock: 2,
            ..Operation::insert(1, "Q".into(), author("b"))
        };
        let transformed = transform(&client, &server);
        assert_eq!(transformed.position, 2);
    }

    #[test]
    fn insert_into_deleted_range_clamps() {
        // S3: server deleted [1,4), client insert(3,"X") -> position 1.
        let server = Operation::delete(1, 3, author("a"));
        let client = Operation::insert(3, "X".into(), author("b"));
        let transformed = transform(&client, &server);
        assert_eq!(transformed.position, 1);
    }

    #[test]
    fn insert_past_deleted_range_shifts_left() {
        let server = Operation::delete(1, 3, author("a"));
        let client = Operation::insert(5, "X".into(), author("b"));
        let transformed = transform(&client, &server);
        assert_eq!(transformed.position, 2);
    }

    #[test]
    fn delete_vs_insert_extends_when_insert_inside_range() {
        let server = Operation::insert(2, "XY".into(), author("a"));
        let client = Operation::delete(1, 3, author("b"));
        let transformed = transform(&client, &server);
        assert_eq!(transformed.position, 1);
        assert_eq!(transformed.length(), Some(5));
    }

    #[test]
    fn delete_vs_delete_fully_subsumed_yields_zero_length() {
        let server = Operation::delete(0, 10, author("a"));
        let client = Operation::delete(2, 3, author("b"));
        let transformed = transform(&client, &server);
        assert_eq!(transformed.length(), Some(0));
    }

    #[test]
    fn delete_vs_delete_overlapping_s4() {
        // S4: server delete(1,3), client delete(2,3). Overlap [2,4) length 2.
        // cp(2) >= sp(1), so reposition to sp=1, length = cl(3) - overlap(2) = 1.
        let server = Operation::delete(1, 3, author("a"));
        let client = Operation::delete(2, 3, author("b"));
        let transformed = transform(&client, &server);
        assert_eq!(transformed.position, 1);
        assert_eq!(transformed.length(), Some(1));
    }

    #[test]
    fn apply_insert_clamps_past_end() {
        let op = Operation::insert(10, "Z".into(), author("a"));
        let result = apply("abc", &op).unwrap();
        assert_eq!(result, "abcZ");
    }

    #[test]
    fn apply_delete_rejects_out_of_range() {
        let op = Operation::delete(2, 5, author("a"));
        assert!(apply("abc", &op).is_err());
    }

    #[test]
    fn tp1_convergence_concurrent_inserts() {
        let a = Operation::insert(0, "X".into(), author("a"));
        let b = Operation::insert(5, "Y".into(), author("b"));
        let content = "hello";

        let a_prime = transform(&a, &b);
        let b_prime = transform(&b, &a);

        let left = apply(&apply(content, &b).unwrap(), &a_prime).unwrap();
        let right = apply(&apply(content, &a).unwrap(), &b_prime).unwrap();
        assert_eq!(left, right);
        assert_eq!(left, "XhelloY");
    }

    #[test]
    fn batch_transform_drops_zero_length_deletes() {
        let server_ops = vec![Operation::delete(0, 10, author("a"))];
        let client_ops = vec![Operation::delete(2, 3, author("b"))];
        let result = transform_batch(client_ops, &server_ops);
        assert!(result.is_empty());
    }

    #[test]
    fn batch_transform_sees_earlier_ops_in_same_batch() {
        // Two client ops from the same batch should chain through each other
        // via the growing local history, even though neither is in server_ops.
        let server_ops: Vec<Operation> = vec![];
        let first = Operation::insert(0, "A".into(), author("x"));
        let second = Operation::insert(0, "B".into(), author("y"));
        let result = transform_batch(vec![first.clone(), second], &server_ops);
        assert_eq!(result.len(), 2);
        // second was transformed against first (different author), so it
        // must have shifted right by first's length if tie-break demands it
        // or stayed depending on priority; either way it must still be valid.
        assert_eq!(result[0].position, 0);
    }
}
