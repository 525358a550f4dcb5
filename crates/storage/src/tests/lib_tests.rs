use super::*;

use chrono::TimeZone;
use shared::domain::{Page, StanzaId};
use shared::protocol::Extension;

const ACCOUNT: &str = "user@example.com";
const REMOTE: &str = "juliet@example.com";

async fn setup() -> (Storage, AccountId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let account = storage
        .create_account(&BareAddress::new(ACCOUNT))
        .await
        .expect("account");
    (storage, account)
}

fn incoming_text(id: u32, body: &str) -> Transformation {
    Transformation {
        received_at: Utc.timestamp_opt(i64::from(id) * 2000, 0).unwrap(),
        to: Some(Address::bare(ACCOUNT)),
        from: Some(Address::bare(REMOTE)),
        remote: Address::bare(REMOTE),
        message_type: MessageType::Chat,
        message_id: Some(format!("m-{id}")),
        stanza_id: Some(StanzaId::new(id.to_string(), BareAddress::new(ACCOUNT))),
        occupant_id: None,
        sender_identity: Some(BareAddress::new(REMOTE)),
        extensions: vec![Extension::Body {
            text: body.to_owned(),
            language: None,
        }],
    }
}

async fn store_message(
    storage: &Storage,
    account: AccountId,
    transformation: &Transformation,
) -> MessageIdentifier {
    let mut writer = storage.writer().await.expect("writer");
    let chat = writer
        .get_or_create_chat(
            account,
            &transformation.remote.to_bare(),
            transformation.message_type,
            false,
        )
        .await
        .expect("chat");
    let identifier = writer
        .get_or_create_message(&chat, transformation, REMOTE)
        .await
        .expect("message");
    writer
        .insert_message_content(
            &identifier,
            &[MessageContent::text("hello", None)],
        )
        .await
        .expect("content");
    if let Some(stanza) = &transformation.stanza_id {
        writer
            .record_live_anchor(account, &stanza.by, &stanza.id)
            .await
            .expect("anchor");
    }
    writer.commit().await.expect("commit");
    identifier
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let (storage, _) = setup().await;
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("messages.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn account_creation_is_idempotent() {
    let (storage, account) = setup().await;
    let again = storage
        .create_account(&BareAddress::new(ACCOUNT))
        .await
        .expect("account");
    assert_eq!(account, again);
    let loaded = storage
        .get_account(&BareAddress::new(ACCOUNT))
        .await
        .expect("load")
        .expect("present");
    assert_eq!(loaded.id, account);
}

#[tokio::test]
async fn chat_rows_are_unique_per_address_and_type() {
    let (storage, account) = setup().await;
    let mut writer = storage.writer().await.expect("writer");
    let remote = BareAddress::new(REMOTE);
    let first = writer
        .get_or_create_chat(account, &remote, MessageType::Chat, false)
        .await
        .expect("chat");
    let second = writer
        .get_or_create_chat(account, &remote, MessageType::Normal, false)
        .await
        .expect("chat");
    let group = writer
        .get_or_create_chat(account, &remote, MessageType::Groupchat, false)
        .await
        .expect("chat");
    let pm = writer
        .get_or_create_chat(account, &remote, MessageType::Chat, true)
        .await
        .expect("chat");
    writer.commit().await.expect("commit");

    assert_eq!(first.id, second.id);
    assert_eq!(first.chat_type, ChatType::Individual);
    assert_ne!(first.id, group.id);
    assert_eq!(group.chat_type, ChatType::Group);
    assert_eq!(pm.chat_type, ChatType::GroupPrivateMessage);
    assert_ne!(pm.id, group.id);
}

#[tokio::test]
async fn natural_key_matches_either_protocol_id() {
    let (storage, account) = setup().await;
    let full = incoming_text(2, "hello");
    let original = store_message(&storage, account, &full).await;

    // the same event seen again with only its archive id
    let mut by_stanza = full.clone();
    by_stanza.message_id = None;
    let replay = store_message(&storage, account, &by_stanza).await;
    assert_eq!(original, replay);

    // and with only its client id
    let mut by_client = full.clone();
    by_client.stanza_id = None;
    let replay = store_message(&storage, account, &by_client).await;
    assert_eq!(original, replay);

    assert_eq!(storage.counts().await.expect("counts").messages, 1);
}

#[tokio::test]
async fn archive_id_is_backfilled_on_replay() {
    let (storage, account) = setup().await;
    let mut live = incoming_text(2, "hello");
    live.stanza_id = None;
    store_message(&storage, account, &live).await;

    let ranges = storage
        .reset_live_page(account, &BareAddress::new(ACCOUNT))
        .await
        .expect("ranges");
    assert_eq!(ranges, vec![Range::reverse(None)]);

    let replay = incoming_text(2, "hello");
    store_message(&storage, account, &replay).await;

    let ranges = storage
        .reset_live_page(account, &BareAddress::new(ACCOUNT))
        .await
        .expect("ranges");
    assert_eq!(
        ranges,
        vec![
            Range::reverse(Some("2".to_owned())),
            Range::normal(Some("2".to_owned()))
        ]
    );
    assert_eq!(storage.counts().await.expect("counts").messages, 1);
}

#[tokio::test]
async fn ambiguous_natural_key_is_a_conflict() {
    let (storage, account) = setup().await;
    let mut only_client = incoming_text(1, "first");
    only_client.stanza_id = None;
    store_message(&storage, account, &only_client).await;

    let mut only_stanza = incoming_text(2, "second");
    only_stanza.message_id = None;
    store_message(&storage, account, &only_stanza).await;

    // one event claiming both ids matches two distinct rows
    let mut claims_both = incoming_text(1, "third");
    claims_both.stanza_id = Some(StanzaId::new("2", BareAddress::new(ACCOUNT)));

    let mut writer = storage.writer().await.expect("writer");
    let chat = writer
        .get_or_create_chat(account, &BareAddress::new(REMOTE), MessageType::Chat, false)
        .await
        .expect("chat");
    let result = writer
        .get_or_create_message(&chat, &claims_both, REMOTE)
        .await;
    assert!(matches!(result, Err(StoreError::Conflict)));
    writer.rollback().await.expect("rollback");
}

#[tokio::test]
async fn correction_version_is_created_once() {
    let (storage, account) = setup().await;
    let original = incoming_text(1, "hallo");
    store_message(&storage, account, &original).await;

    let mut correction = incoming_text(1, "hello");
    correction.message_id = Some("c-1".to_owned());
    correction.stanza_id = Some(StanzaId::new("3", BareAddress::new(ACCOUNT)));

    let mut writer = storage.writer().await.expect("writer");
    let chat = writer
        .get_or_create_chat(account, &BareAddress::new(REMOTE), MessageType::Chat, false)
        .await
        .expect("chat");
    let first = writer
        .get_or_create_version(&chat, &correction, "m-1", Modification::Correction, REMOTE)
        .await
        .expect("version");
    writer
        .insert_message_content(&first, &[MessageContent::text("hello", None)])
        .await
        .expect("content");
    let second = writer
        .get_or_create_version(&chat, &correction, "m-1", Modification::Correction, REMOTE)
        .await
        .expect("version");
    writer.commit().await.expect("commit");

    assert_eq!(first, second);
    let counts = storage.counts().await.expect("counts");
    assert_eq!(counts.messages, 1);
    assert_eq!(counts.versions, 2);

    let message = storage
        .get_message_with_contents(first.id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(message.modification, Modification::Correction);
    assert_eq!(message.latest_version, first.version);
    assert_eq!(
        message.contents,
        vec![MessageContent::text("hello", None)]
    );
}

#[tokio::test]
async fn modification_for_unknown_target_creates_stub() {
    let (storage, account) = setup().await;
    let mut correction = incoming_text(1, "hello");
    correction.message_id = Some("c-1".to_owned());
    correction.stanza_id = None;

    let mut writer = storage.writer().await.expect("writer");
    let chat = writer
        .get_or_create_chat(account, &BareAddress::new(REMOTE), MessageType::Chat, false)
        .await
        .expect("chat");
    let stub = writer
        .get_or_create_version(&chat, &correction, "m-9", Modification::Correction, REMOTE)
        .await
        .expect("version");
    writer.commit().await.expect("commit");

    // the original arriving afterwards resolves to the stub row
    let mut late_original = incoming_text(9, "hallo");
    late_original.stanza_id = None;
    let resolved = store_message(&storage, account, &late_original).await;
    assert_eq!(resolved.id, stub.id);
    assert_eq!(storage.counts().await.expect("counts").messages, 1);
}

#[tokio::test]
async fn content_insert_keeps_existing_parts() {
    let (storage, account) = setup().await;
    let transformation = incoming_text(1, "hello");
    let identifier = store_message(&storage, account, &transformation).await;

    let mut writer = storage.writer().await.expect("writer");
    writer
        .insert_message_content(&identifier, &[MessageContent::text("other", None)])
        .await
        .expect("content");
    writer.commit().await.expect("commit");

    let message = storage
        .get_message_with_contents(identifier.id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(message.contents, vec![MessageContent::text("hello", None)]);
    assert_eq!(storage.counts().await.expect("counts").contents, 1);
}

#[tokio::test]
async fn state_marker_is_new_only_once() {
    let (storage, account) = setup().await;
    let transformation = incoming_text(1, "hello");
    store_message(&storage, account, &transformation).await;

    let state = MessageState {
        from_bare: BareAddress::new(REMOTE),
        from_resource: Some("phone".to_owned()),
        kind: StateKind::Displayed,
        error_condition: None,
        error_text: None,
    };

    let mut writer = storage.writer().await.expect("writer");
    let chat = writer
        .get_or_create_chat(account, &BareAddress::new(REMOTE), MessageType::Chat, false)
        .await
        .expect("chat");
    let first = writer
        .insert_message_state(&chat, "m-1", &state)
        .await
        .expect("state");
    let second = writer
        .insert_message_state(&chat, "m-1", &state)
        .await
        .expect("state");
    let unknown = writer
        .insert_message_state(&chat, "m-404", &state)
        .await
        .expect("state");
    writer.commit().await.expect("commit");

    assert!(first);
    assert!(!second);
    assert!(!unknown);
    assert_eq!(storage.counts().await.expect("counts").states, 1);
}

#[tokio::test]
async fn reactions_replace_one_senders_set() {
    let (storage, account) = setup().await;
    let transformation = incoming_text(1, "hello");
    let identifier = store_message(&storage, account, &transformation).await;

    let mut writer = storage.writer().await.expect("writer");
    let chat = writer
        .get_or_create_chat(account, &BareAddress::new(REMOTE), MessageType::Chat, false)
        .await
        .expect("chat");
    writer
        .insert_reactions(
            &chat,
            &ReactionsPayload {
                id: "m-1".to_owned(),
                reactions: vec!["\u{1F44D}".to_owned(), "\u{2764}".to_owned()],
            },
            &transformation,
            REMOTE,
        )
        .await
        .expect("reactions");
    writer
        .insert_reactions(
            &chat,
            &ReactionsPayload {
                id: "m-1".to_owned(),
                reactions: vec!["\u{2764}".to_owned()],
            },
            &transformation,
            REMOTE,
        )
        .await
        .expect("reactions");
    writer.commit().await.expect("commit");

    let message = storage
        .get_message_with_contents(identifier.id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(message.reactions.len(), 1);
    assert_eq!(message.reactions[0].reaction, "\u{2764}");
    assert_eq!(
        message.reactions[0].reaction_by,
        Some(BareAddress::new(REMOTE))
    );
}

#[tokio::test]
async fn reply_link_keeps_raw_id_for_unknown_target() {
    let (storage, account) = setup().await;
    let transformation = incoming_text(1, "hello");
    let identifier = store_message(&storage, account, &transformation).await;

    let mut writer = storage.writer().await.expect("writer");
    let chat = writer
        .get_or_create_chat(account, &BareAddress::new(REMOTE), MessageType::Chat, false)
        .await
        .expect("chat");
    writer
        .set_in_reply_to(
            &chat,
            &identifier,
            &Address::bare(REMOTE),
            "m-404",
            Some((0, 12)),
        )
        .await
        .expect("reply");
    writer.commit().await.expect("commit");

    let message = storage
        .get_message_with_contents(identifier.id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(message.in_reply_to_id.as_deref(), Some("m-404"));
    assert_eq!(message.in_reply_to_message, None);
    assert_eq!(message.fallback_span, Some((0, 12)));
}

#[tokio::test]
async fn virgin_archive_queries_from_the_remote_tail() {
    let (storage, account) = setup().await;
    let ranges = storage
        .reset_live_page(account, &BareAddress::new(ACCOUNT))
        .await
        .expect("ranges");
    assert_eq!(ranges, vec![Range::reverse(None)]);
}

#[tokio::test]
async fn stale_page_submission_is_ignored() {
    let (storage, account) = setup().await;
    let archive = BareAddress::new(ACCOUNT);
    storage
        .submit_page(
            account,
            &archive,
            &Range::normal(Some("9".to_owned())),
            &QueryResult::new(true, Page::new("10", "12", 3)),
            false,
        )
        .await
        .expect("submit");
    let ranges = storage
        .reset_live_page(account, &archive)
        .await
        .expect("ranges");
    assert_eq!(ranges, vec![Range::reverse(None)]);
}

#[tokio::test]
async fn reverse_completion_is_durable_and_replay_safe() {
    let (storage, account) = setup().await;
    let archive = BareAddress::new(ACCOUNT);
    store_message(&storage, account, &incoming_text(2, "hello")).await;

    let reverse = Range::reverse(Some("2".to_owned()));
    let result = QueryResult::new(true, Page::empty(None));
    storage
        .submit_page(account, &archive, &reverse, &result, false)
        .await
        .expect("submit");
    // replaying the exact same result must not flip anything back
    storage
        .submit_page(account, &archive, &reverse, &result, false)
        .await
        .expect("submit");

    let ranges = storage
        .reset_live_page(account, &archive)
        .await
        .expect("ranges");
    assert_eq!(ranges, vec![Range::normal(Some("2".to_owned()))]);
}

#[tokio::test]
async fn normal_page_submission_advances_the_anchor() {
    let (storage, account) = setup().await;
    let archive = BareAddress::new(ACCOUNT);
    store_message(&storage, account, &incoming_text(2, "hello")).await;

    let normal = Range::normal(Some("2".to_owned()));
    let result = QueryResult::new(false, Page::new("3", "4", 2));
    storage
        .submit_page(account, &archive, &normal, &result, false)
        .await
        .expect("submit");

    let ranges = storage
        .reset_live_page(account, &archive)
        .await
        .expect("ranges");
    assert_eq!(
        ranges,
        vec![
            Range::reverse(Some("2".to_owned())),
            Range::normal(Some("4".to_owned()))
        ]
    );

    // the same page again records nothing new
    storage
        .submit_page(
            account,
            &archive,
            &Range::normal(Some("4".to_owned())),
            &QueryResult::new(false, Page::new("3", "4", 2)),
            false,
        )
        .await
        .expect("submit");
    let ranges = storage
        .reset_live_page(account, &archive)
        .await
        .expect("ranges");
    assert_eq!(
        ranges,
        vec![
            Range::reverse(Some("2".to_owned())),
            Range::normal(Some("4".to_owned()))
        ]
    );
}

#[tokio::test]
async fn clear_archive_restores_virgin_state() {
    let (storage, account) = setup().await;
    let archive = BareAddress::new(ACCOUNT);
    store_message(&storage, account, &incoming_text(2, "hello")).await;
    storage
        .submit_page(
            account,
            &archive,
            &Range::reverse(Some("2".to_owned())),
            &QueryResult::new(true, Page::empty(None)),
            false,
        )
        .await
        .expect("submit");

    storage
        .clear_archive(account, &archive)
        .await
        .expect("clear");

    let ranges = storage
        .reset_live_page(account, &archive)
        .await
        .expect("ranges");
    assert_eq!(ranges, vec![Range::reverse(None)]);
    assert_eq!(storage.counts().await.expect("counts"), StoreCounts::default());
}

#[tokio::test]
async fn chat_log_interleaves_date_separators() {
    let (storage, account) = setup().await;
    store_message(&storage, account, &incoming_text(2, "hello")).await;
    // 50 days later
    let mut later = incoming_text(3, "again");
    later.received_at = Utc.timestamp_opt(50 * 86_400, 0).unwrap();
    store_message(&storage, account, &later).await;

    let chat = storage
        .get_chat(account, &BareAddress::new(REMOTE), ChatType::Individual)
        .await
        .expect("chat")
        .expect("present");
    let log = storage.list_chat_log(chat.id, 10).await.expect("log");
    assert_eq!(log.len(), 4);
    assert!(matches!(log[0], ChatLogItem::DateSeparator(_)));
    assert!(matches!(log[1], ChatLogItem::Message(_)));
    assert!(matches!(log[2], ChatLogItem::DateSeparator(_)));
    assert!(matches!(log[3], ChatLogItem::Message(_)));
}
