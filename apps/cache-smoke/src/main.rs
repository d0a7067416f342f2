mod logging;

use cache_client::ChatCache;
use cache_core::{
    CacheConfig, CacheError, CreateGroupInput, CreateMessageInput, GroupId, Query, SyncEvent,
    UpdateGroupInput, UserId, ViewModel,
};
use cache_remote_memory::{InMemoryRemote, RemoteOp};
use tracing::{error, info, warn};

const SEEDED_MESSAGES: usize = 23;

#[tokio::main]
async fn main() {
    logging::init();

    let config = match CacheConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid cache configuration: {err}");
            std::process::exit(2);
        }
    };

    if let Err(err) = run(config).await {
        error!(code = %err.code, "smoke session failed: {err}");
        std::process::exit(1);
    }
}

async fn run(config: CacheConfig) -> Result<(), CacheError> {
    let remote = InMemoryRemote::new();
    let alice = remote.add_user("alice")?;
    let bob = remote.add_user("bob")?;
    let crew = remote.add_group("crew", &[alice.id, bob.id])?;
    for n in 1..=SEEDED_MESSAGES {
        let from = if n % 2 == 0 { alice.id } else { bob.id };
        remote.post_message(crew.id, from, &format!("message {n}"))?;
    }

    info!(
        page_size = config.page_size,
        dedup_proximity_ms = config.dedup_proximity_ms,
        "starting smoke session"
    );
    let cache = ChatCache::new(remote.clone(), config);
    let mut events = cache.events();

    cache.load_user(alice.id).await?;
    log_view("group list", &cache.read(&Query::UserGroups { user_id: alice.id })?);

    let mut binding = cache.subscribe(Query::GroupWindow { group_id: crew.id })?;
    let opened = cache.open_group(crew.id).await?;
    info!(window_len = opened.window_len, "group opened");
    loop {
        let merged = cache.load_more_messages(crew.id).await?;
        info!(
            offset = merged.offset,
            appended = merged.appended,
            window_len = merged.window_len,
            exhausted = merged.exhausted,
            "page merged"
        );
        if merged.exhausted {
            break;
        }
    }

    let sent = cache.create_message(message(crew.id, alice.id, "hello from smoke")).await?;
    info!(message_id = %sent.id, "message promoted");

    remote.fail_next(
        RemoteOp::CreateMessage,
        CacheError::remote("server_error", "injected failure"),
    )?;
    match cache.create_message(message(crew.id, alice.id, "this one fails")).await {
        Ok(message) => warn!(message_id = %message.id, "expected injected failure"),
        Err(err) => info!(code = %err.code, "message rolled back"),
    }

    let lunch = cache
        .create_group(CreateGroupInput {
            name: "lunch".to_owned(),
            user_ids: vec![bob.id],
            creator_id: alice.id,
        })
        .await?;
    cache
        .update_group(UpdateGroupInput {
            group_id: lunch.id,
            name: "lunch plans".to_owned(),
        })
        .await?;

    let projection = binding.changed().await?;
    info!(
        revision = projection.revision,
        computations = projection.computations,
        "group window binding"
    );
    log_view("group window", &projection.view);
    log_view("group list", &cache.read(&Query::UserGroups { user_id: alice.id })?);

    let (mut settled, mut pages) = (0, 0);
    while let Ok(event) = events.try_recv() {
        match event {
            SyncEvent::MutationSettled(_) => settled += 1,
            SyncEvent::PageMerged(_) | SyncEvent::WindowReloaded { .. } => pages += 1,
        }
    }
    info!(settled, pages, "events observed");
    Ok(())
}

fn message(group_id: GroupId, user_id: UserId, text: &str) -> CreateMessageInput {
    CreateMessageInput {
        group_id,
        user_id,
        text: text.to_owned(),
    }
}

fn log_view(label: &str, view: &ViewModel) {
    match view {
        ViewModel::GroupWindow(group) => {
            info!(
                label,
                group = %group.name,
                members = group.members.len(),
                messages = group.messages.len(),
                head = group.messages.first().map(|m| m.text.as_str()).unwrap_or("-"),
                "view"
            );
        }
        ViewModel::UserGroups(list) => {
            for group in &list.groups {
                info!(
                    label,
                    user = %list.user.username,
                    group = %group.name,
                    latest = group
                        .latest_message
                        .as_ref()
                        .map(|m| m.text.as_str())
                        .unwrap_or("-"),
                    "view"
                );
            }
        }
        ViewModel::Missing => warn!(label, "view root not loaded"),
    }
}
