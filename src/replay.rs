//! Replay of provenance events
//!
//! Reconstructs a flow file from the immutable content claim recorded on a
//! prior provenance event and enqueues it on the queue the original was
//! taken from. Every precondition failure surfaces a specific reason to the
//! caller; nothing is mutated until all preconditions hold.

use crate::context::EngineContext;
use crate::error::{EngineError, EngineResult};
use crate::flowfile::{attributes, FlowFileRecord};
use crate::graph::FlowGraph;
use crate::repo::{
    ProvenanceEventRecord, ProvenanceEventType, RepositoryRecord, RepositoryRecordType,
};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Replay the provenance event with the given id. On success the
/// reconstructed flow file has been enqueued on the recovered source queue
/// and a REPLAY event registered; the returned record is the new flow file.
pub(crate) fn replay_event(
    graph: &FlowGraph,
    context: &Arc<EngineContext>,
    event_id: u64,
) -> EngineResult<FlowFileRecord> {
    let event = context
        .repositories
        .provenance
        .event(event_id)?
        .ok_or_else(|| {
            EngineError::Replay(format!("Provenance event with ID {} not found", event_id))
        })?;

    if event.event_type == ProvenanceEventType::Join {
        return Err(EngineError::Replay(
            "Cannot replay events that are created from multiple parents".to_string(),
        ));
    }

    let previous_claim = event.previous_claim.clone().ok_or_else(|| {
        EngineError::Replay(
            "Cannot replay data from Provenance Event because the event does not contain the \
             required Content Claim"
                .to_string(),
        )
    })?;

    if !context.repositories.content.is_accessible(&previous_claim)? {
        return Err(EngineError::Replay(
            "Cannot replay data from Provenance Event because the data is no longer available \
             in the Content Repository"
                .to_string(),
        ));
    }

    let queue_id = event.source_queue_id.clone().ok_or_else(|| {
        EngineError::Replay(
            "Cannot replay data from Provenance Event because the event does not specify the \
             Source FlowFile Queue"
                .to_string(),
        )
    })?;

    let connection = graph.connection(&queue_id).cloned().ok_or_else(|| {
        EngineError::Replay(format!(
            "Cannot replay data from Provenance Event because the Source FlowFile Queue with \
             ID {} no longer exists",
            queue_id
        ))
    })?;

    // Take a fresh reference on the claim, then re-verify accessibility: the
    // content repository may reclaim between the precondition check and the
    // increment.
    let claim = context.claims.new_claim(
        previous_claim.claim.container.clone(),
        previous_claim.claim.section.clone(),
        previous_claim.claim.id.clone(),
        previous_claim.claim.loss_tolerant,
    );
    context.claims.increment(&claim);
    match context.repositories.content.is_accessible(&previous_claim) {
        Ok(true) => {}
        Ok(false) => {
            context.claims.decrement(&claim);
            return Err(EngineError::Replay(
                "Cannot replay data from Provenance Event because the data is no longer \
                 available in the Content Repository"
                    .to_string(),
            ));
        }
        Err(e) => {
            context.claims.decrement(&claim);
            return Err(e);
        }
    }

    let new_uuid = Uuid::new_v4().to_string();
    let mut new_attributes = event.attributes.clone();
    new_attributes.remove(attributes::DISCARD_REASON);
    new_attributes.remove(attributes::ALTERNATE_IDENTIFIER);
    new_attributes.insert(attributes::UUID.to_string(), new_uuid.clone());
    new_attributes.insert(attributes::REPLAY.to_string(), "true".to_string());
    new_attributes.insert(
        attributes::REPLAY_TIMESTAMP.to_string(),
        Utc::now().timestamp_millis().to_string(),
    );

    let now = Utc::now();
    let mut lineage_ids: std::collections::HashSet<String> = std::collections::HashSet::new();
    lineage_ids.insert(event.flowfile_uuid.clone());

    let record = FlowFileRecord {
        id: context.repositories.flowfile.next_sequence(),
        entry_date: now,
        lineage_start: now,
        lineage_ids,
        attributes: new_attributes,
        content: Some(previous_claim.clone()),
    };

    context.repositories.flowfile.update_repository(&[RepositoryRecord {
        record: record.clone(),
        record_type: RepositoryRecordType::Create,
        destination_queue: Some(queue_id.clone()),
    }])?;

    connection.queue().offer(record.clone());

    let replay_event = ProvenanceEventRecord {
        id: 0,
        event_type: ProvenanceEventType::Replay,
        flowfile_uuid: new_uuid.clone(),
        parent_uuids: vec![event.flowfile_uuid.clone()],
        child_uuids: vec![new_uuid],
        component_id: event.component_id.clone(),
        attributes: record.attributes.clone(),
        previous_claim: Some(previous_claim),
        source_queue_id: Some(queue_id),
        details: Some(format!("Replay of event {}", event.id)),
        timestamp: Utc::now(),
    };
    context.repositories.provenance.register_event(replay_event)?;

    tracing::info!(
        event = event_id,
        flowfile = %record.uuid(),
        "Replayed provenance event"
    );
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::ContentClaim;
    use crate::config::EngineSettings;
    use crate::flowfile::ContentClaimRef;
    use crate::graph::{ConnectableKind, ConnectableNode, Connection};
    use crate::repo::memory::InMemoryContentRepository;
    use crate::repo::RepositorySet;
    use std::collections::HashMap;

    fn fixture() -> (FlowGraph, Arc<EngineContext>, Arc<InMemoryContentRepository>) {
        let content = Arc::new(InMemoryContentRepository::new());
        let mut repos = RepositorySet::in_memory(16);
        repos.content = content.clone();
        let context = Arc::new(EngineContext::new(repos, EngineSettings::default()));

        let mut graph = FlowGraph::new("root", "Flow");
        let a = Arc::new(ConnectableNode::new(
            "src",
            ConnectableKind::Funnel,
            "src",
            "root",
        ));
        let b = Arc::new(ConnectableNode::new(
            "dst",
            ConnectableKind::Funnel,
            "dst",
            "root",
        ));
        graph.add_connectable("root", a.clone()).expect("add");
        graph.add_connectable("root", b.clone()).expect("add");
        let connection = Arc::new(Connection::new("q1", "root", a, b, vec![String::new()]));
        graph.add_connection("root", connection).expect("add");
        (graph, context, content)
    }

    fn claim_ref() -> ContentClaimRef {
        ContentClaimRef {
            claim: ContentClaim::new("c1", "s1", "blob-1", false),
            offset: 0,
            size: 4,
        }
    }

    fn event(
        event_type: ProvenanceEventType,
        claim: Option<ContentClaimRef>,
        queue: Option<String>,
    ) -> ProvenanceEventRecord {
        ProvenanceEventRecord {
            id: 0,
            event_type,
            flowfile_uuid: "original-uuid".to_string(),
            parent_uuids: Vec::new(),
            child_uuids: Vec::new(),
            component_id: "src".to_string(),
            attributes: HashMap::from([
                ("filename".to_string(), "data.bin".to_string()),
                (
                    attributes::DISCARD_REASON.to_string(),
                    "late".to_string(),
                ),
            ]),
            previous_claim: claim,
            source_queue_id: queue,
            details: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_replay_join_rejected() {
        let (graph, context, _) = fixture();
        let id = context
            .repositories
            .provenance
            .register_event(event(
                ProvenanceEventType::Join,
                Some(claim_ref()),
                Some("q1".to_string()),
            ))
            .expect("register");
        let err = replay_event(&graph, &context, id).expect_err("join not replayable");
        assert_eq!(
            err.to_string(),
            "Cannot replay events that are created from multiple parents"
        );
    }

    #[test]
    fn test_replay_requires_claim() {
        let (graph, context, _) = fixture();
        let id = context
            .repositories
            .provenance
            .register_event(event(
                ProvenanceEventType::Create,
                None,
                Some("q1".to_string()),
            ))
            .expect("register");
        let err = replay_event(&graph, &context, id).expect_err("claim required");
        assert!(err.to_string().contains("required Content Claim"));
    }

    #[test]
    fn test_replay_requires_accessible_content() {
        let (graph, context, _) = fixture();
        let id = context
            .repositories
            .provenance
            .register_event(event(
                ProvenanceEventType::Create,
                Some(claim_ref()),
                Some("q1".to_string()),
            ))
            .expect("register");
        let err = replay_event(&graph, &context, id).expect_err("content gone");
        assert!(err.to_string().contains("no longer available"));
        assert_eq!(context.claims.claimant_count(&claim_ref().claim), 0);
    }

    #[test]
    fn test_replay_requires_live_queue() {
        let (graph, context, content) = fixture();
        content.put(&claim_ref(), b"data".to_vec());
        let id = context
            .repositories
            .provenance
            .register_event(event(
                ProvenanceEventType::Create,
                Some(claim_ref()),
                Some("gone".to_string()),
            ))
            .expect("register");
        let err = replay_event(&graph, &context, id).expect_err("queue gone");
        assert!(err.to_string().contains("no longer exists"));
    }

    #[test]
    fn test_replay_success() {
        let (graph, context, content) = fixture();
        content.put(&claim_ref(), b"data".to_vec());
        let id = context
            .repositories
            .provenance
            .register_event(event(
                ProvenanceEventType::Create,
                Some(claim_ref()),
                Some("q1".to_string()),
            ))
            .expect("register");

        let record = replay_event(&graph, &context, id).expect("replay succeeds");

        assert_eq!(
            record.attributes.get(attributes::REPLAY).map(String::as_str),
            Some("true")
        );
        assert!(record.attributes.contains_key(attributes::REPLAY_TIMESTAMP));
        assert!(!record.attributes.contains_key(attributes::DISCARD_REASON));
        assert_eq!(
            record.attributes.get("filename").map(String::as_str),
            Some("data.bin")
        );
        assert_eq!(context.claims.claimant_count(&claim_ref().claim), 1);

        // The record landed on the recovered queue.
        let connection = graph.connection("q1").expect("connection");
        assert_eq!(connection.queue().size().object_count, 1);

        // A REPLAY event was registered with the original as parent.
        let events = context
            .repositories
            .provenance
            .events(0, 100)
            .expect("events");
        let replay = events
            .iter()
            .find(|e| e.event_type == ProvenanceEventType::Replay)
            .expect("replay event registered");
        assert_eq!(replay.parent_uuids, vec!["original-uuid".to_string()]);
        assert_eq!(replay.flowfile_uuid, record.uuid());
    }
}
