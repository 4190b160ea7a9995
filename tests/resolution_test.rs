//! End-to-end resolution through the engine

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{global, group_ref, world, PermsTest, PLAYER};
use futures_util::future::join_all;
use permsd::context::SimpleContextDefinition;
use permsd::{
    ContextMatching, ContextSet, ContextValue, EngineConfig, ImmutableSubjectData, SubjectRef,
    SubjectTypeDefinition,
};

#[tokio::test]
async fn test_transient_overrides_persistent() {
    let perms = PermsTest::start().await.unwrap();
    let user = perms.user(PLAYER).await;

    user.update(false, |d| d.set_permission(&global(), "p", -1))
        .await
        .unwrap();
    user.update(true, |d| d.set_permission(&global(), "p", 1))
        .await
        .unwrap();
    assert_eq!(user.permission(&global(), "p"), 1);

    // Clearing the transient value exposes the persistent one again
    user.update(true, |d| d.set_permission(&global(), "p", 0))
        .await
        .unwrap();
    assert_eq!(user.permission(&global(), "p"), -1);
}

#[tokio::test]
async fn test_persistent_priority_subject_type() {
    let perms = PermsTest::start().await.unwrap();
    perms
        .engine
        .register_subject_type(SubjectTypeDefinition::new("npc").with_transient_priority(false));
    let npc = perms.engine.subject("npc", "guard").await.unwrap();

    npc.update(false, |d| d.set_permission(&global(), "p", -1))
        .await
        .unwrap();
    npc.update(true, |d| d.set_permission(&global(), "p", 1))
        .await
        .unwrap();
    assert_eq!(npc.permission(&global(), "p"), -1);
}

#[tokio::test]
async fn test_segment_exactness() {
    let perms = PermsTest::start().await.unwrap();
    let user = perms.user(PLAYER).await;
    user.update(false, |d| d.set_permission(&world("nether"), "fly", 1))
        .await
        .unwrap();

    let arena = world("nether").with(ContextValue::new("region", "arena"));
    assert_eq!(user.permission(&world("nether"), "fly"), 1);
    assert_eq!(user.permission(&global(), "fly"), 0);
    assert_eq!(user.permission(&arena, "fly"), 0);
}

#[tokio::test]
async fn test_parents_inherit_in_order() {
    let perms = PermsTest::start().await.unwrap();
    let user = perms.user(PLAYER).await;
    user.update(false, |d| {
        d.set_parents(&global(), vec![group_ref("vip"), group_ref("member")])
    })
    .await
    .unwrap();

    let vip = perms.group("vip").await;
    let member = perms.group("member").await;
    vip.update(false, |d| {
        d.set_permission(&global(), "chat.color", 1)
            .set_option(&global(), "prefix", Some("[VIP]"))
    })
    .await
    .unwrap();
    member
        .update(false, |d| {
            d.set_permission(&global(), "chat.color", -1)
                .set_permission(&global(), "chat.*", 1)
                .set_option(&global(), "prefix", Some("[M]"))
                .set_option(&global(), "suffix", Some("!"))
        })
        .await
        .unwrap();

    assert_eq!(user.permission(&global(), "chat.color.red"), 1);
    assert_eq!(user.permission(&global(), "chat.emote"), 1);
    assert_eq!(user.option(&global(), "prefix").as_deref(), Some("[VIP]"));
    assert_eq!(user.option(&global(), "suffix").as_deref(), Some("!"));
    assert_eq!(user.parents(&global()), vec![group_ref("vip"), group_ref("member")]);

    let parents: Vec<SubjectRef> = user
        .parent_subjects(&global())
        .iter()
        .map(|s| s.subject().clone())
        .collect();
    assert_eq!(parents, vec![group_ref("vip"), group_ref("member")]);

    let all = user.permissions(&global());
    assert_eq!(all["chat.color"], 1);
    assert_eq!(all["chat"], 1);
}

#[tokio::test]
async fn test_cyclic_parents_terminate() {
    let perms = PermsTest::start().await.unwrap();
    let a = perms.group("a").await;
    let b = perms.group("b").await;

    a.update(false, |d| {
        d.add_parent(&global(), group_ref("b"))
            .set_permission(&global(), "from.a", 1)
    })
    .await
    .unwrap();
    b.update(false, |d| {
        d.add_parent(&global(), group_ref("a"))
            .set_permission(&global(), "from.b", 1)
    })
    .await
    .unwrap();

    assert_eq!(a.permission(&global(), "from.a"), 1);
    assert_eq!(a.permission(&global(), "from.b"), 1);
    assert_eq!(a.permission(&global(), "unrelated"), 0);
    assert_eq!(b.permission(&global(), "from.a"), 1);
    assert_eq!(a.parents(&global()), vec![group_ref("b")]);
}

#[tokio::test]
async fn test_self_parent_is_ignored() {
    let perms = PermsTest::start().await.unwrap();
    let a = perms.group("loop").await;
    a.update(false, |d| {
        d.add_parent(&global(), group_ref("loop"))
            .set_permission(&global(), "x", 1)
    })
    .await
    .unwrap();
    assert_eq!(a.permission(&global(), "x"), 1);
}

#[tokio::test]
async fn test_ancestor_change_invalidates_dependents() {
    let perms = PermsTest::start().await.unwrap();
    let user = perms.user(PLAYER).await;
    let change = user
        .update(false, |d| d.add_parent(&global(), group_ref("admin")))
        .await
        .unwrap();
    assert!(change.changed());
    let again = user
        .update(false, |d| d.add_parent(&global(), group_ref("admin")))
        .await
        .unwrap();
    assert!(!again.changed());

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = fired.clone();
    user.register_listener(move |_| {
        fired_clone.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(user.permission(&global(), "kick"), 0);

    let admin = perms.group("admin").await;
    admin
        .update(false, |d| d.set_permission(&global(), "kick", 1))
        .await
        .unwrap();

    assert_eq!(user.permission(&global(), "kick"), 1);
    assert!(fired.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_newly_added_parent_is_visible_after_update() {
    let perms = PermsTest::seeded(
        EngineConfig::default(),
        r#"{ "subjects": { "group:builder": [ { "permissions": { "build": 1 } } ] } }"#,
    )
    .await
    .unwrap();
    let user = perms.user(PLAYER).await;
    assert!(!user.has_permission(&global(), "build"));

    user.update(false, |d| d.add_parent(&global(), group_ref("builder")))
        .await
        .unwrap();
    assert!(user.has_permission(&global(), "build.place"));
}

#[tokio::test]
async fn test_defaults_subjects_apply_last() {
    let perms = PermsTest::start().await.unwrap();
    let user = perms.user(PLAYER).await;

    let user_defaults = perms.engine.subject("default", "user").await.unwrap();
    let global_defaults = perms.engine.subject("default", "default").await.unwrap();
    user_defaults
        .update(false, |d| {
            d.set_permission(&global(), "chat", 1)
                .set_option(&global(), "prefix", Some("[Player]"))
        })
        .await
        .unwrap();
    global_defaults
        .update(false, |d| {
            d.set_permission(&global(), "chat", -1)
                .set_permission(&global(), "help", 1)
        })
        .await
        .unwrap();

    assert_eq!(user.permission(&global(), "chat"), 1);
    assert_eq!(user.permission(&global(), "help"), 1);
    assert_eq!(user.option(&global(), "prefix").as_deref(), Some("[Player]"));

    user.update(false, |d| d.set_permission(&global(), "chat", -1))
        .await
        .unwrap();
    assert_eq!(user.permission(&global(), "chat"), -1);

    // Groups only see the global defaults
    let group = perms.group("anyone").await;
    assert_eq!(group.permission(&global(), "chat"), -1);
}

#[tokio::test]
async fn test_default_value_fallback() {
    let perms = PermsTest::start().await.unwrap();
    let user = perms.user(PLAYER).await;
    user.update(false, |d| {
        d.set_permission(&global(), "*", -1)
            .set_permission(&global(), "spawn", 1)
    })
    .await
    .unwrap();

    assert_eq!(user.default_value(&global()), -1);
    assert_eq!(user.permission(&global(), "spawn"), 1);
    assert_eq!(user.permission(&global(), "anything.else"), -1);
}

#[tokio::test]
async fn test_context_inheritance_in_exact_mode() {
    let perms = PermsTest::start().await.unwrap();
    let group = perms.group("explorer").await;
    group
        .update(false, |d| d.set_permission(&world("overworld"), "mine", 1))
        .await
        .unwrap();
    assert_eq!(group.permission(&world("nether"), "mine"), 0);

    let change = perms
        .engine
        .update_context_inheritance(|ci| {
            ci.with_parents(
                ContextValue::new("world", "nether"),
                vec![ContextValue::new("world", "overworld")],
            )
        })
        .await
        .unwrap();
    assert!(change.changed());
    assert_eq!(group.permission(&world("nether"), "mine"), 1);

    // Persisted through the store
    let stored = perms.store.snapshot().await.context_inheritance;
    assert_eq!(
        stored.parents(&ContextValue::new("world", "nether")),
        &[ContextValue::new("world", "overworld")]
    );
}

#[tokio::test]
async fn test_subset_matching_mode() {
    let config = EngineConfig::default().with_context_matching(ContextMatching::Subset);
    let perms = PermsTest::with_config(config).await.unwrap();
    let group = perms.group("builder").await;
    group
        .update(false, |d| {
            d.set_permission(&global(), "build", 1)
                .set_permission(&world("nether"), "build", -1)
                .set_option(&global(), "prefix", Some("[B]"))
        })
        .await
        .unwrap();

    let arena = world("nether").with(ContextValue::new("region", "arena"));
    assert_eq!(group.permission(&arena, "build"), -1);
    assert_eq!(group.permission(&world("end"), "build"), 1);
    assert_eq!(group.option(&arena, "prefix").as_deref(), Some("[B]"));
}

#[tokio::test]
async fn test_exact_mode_ignores_general_segments() {
    let perms = PermsTest::start().await.unwrap();
    let group = perms.group("builder").await;
    group
        .update(false, |d| d.set_permission(&global(), "build", 1))
        .await
        .unwrap();
    assert_eq!(group.permission(&world("nether"), "build"), 0);
}

#[tokio::test]
async fn test_active_contexts_include_server_tags() {
    let config = EngineConfig::default().with_server_tags(["lobby"]);
    let perms = PermsTest::with_config(config).await.unwrap();
    let user = perms.user(PLAYER).await;

    let active = user.active_contexts();
    assert!(active.contains(&ContextValue::new("server-tag", "lobby")));
    assert!(active.get("before").is_some());
    assert!(active.get("after").is_some());

    let tagged = ContextSet::of([ContextValue::new("server-tag", "lobby")]);
    user.update(false, |d| d.set_permission(&tagged, "lobby.fly", 1))
        .await
        .unwrap();
    assert_eq!(user.permission(&tagged, "lobby.fly"), 1);
    assert_eq!(user.permission(&user.active_contexts(), "lobby.fly"), 1);
}

#[tokio::test]
async fn test_active_contexts_resolve_global_data() {
    let perms = PermsTest::start().await.unwrap();
    let user = perms.user(PLAYER).await;
    user.update(false, |d| {
        d.set_permission(&global(), "chat", 1)
            .set_option(&global(), "prefix", Some("[P]"))
    })
    .await
    .unwrap();

    let active = user.active_contexts();
    assert_eq!(user.permission(&active, "chat"), 1);
    assert_eq!(user.option(&active, "prefix").as_deref(), Some("[P]"));
}

#[tokio::test]
async fn test_time_windows_filter_active_contexts() {
    let perms = PermsTest::start().await.unwrap();
    let user = perms.user(PLAYER).await;
    let until_future = ContextSet::of([ContextValue::new("before", "2999-01-01T00:00:00Z")]);
    let until_past = ContextSet::of([ContextValue::new("before", "2000-01-01T00:00:00Z")]);
    let since_past = ContextSet::of([ContextValue::new("after", "2000-01-01T00:00:00Z")]);
    user.update(false, |d| {
        d.set_permission(&until_future, "event.join", 1)
            .set_permission(&until_past, "beta.join", 1)
            .set_permission(&since_past, "season.join", 1)
    })
    .await
    .unwrap();

    let active = user.active_contexts();
    assert_eq!(user.permission(&active, "event.join"), 1);
    assert_eq!(user.permission(&active, "beta.join"), 0);
    assert_eq!(user.permission(&active, "season.join"), 1);
    // Named contexts still have to match exactly
    let nether = active.with(ContextValue::new("world", "nether"));
    assert_eq!(user.permission(&nether, "event.join"), 0);
}

#[tokio::test]
async fn test_uncached_ancestor_reloads_for_dependents() {
    let perms = PermsTest::start().await.unwrap();
    let admin = perms.group("admin").await;
    admin
        .update(false, |d| d.set_permission(&global(), "kick", 1))
        .await
        .unwrap();
    let user = perms.user(PLAYER).await;
    user.update(false, |d| d.add_parent(&global(), group_ref("admin")))
        .await
        .unwrap();
    assert_eq!(user.permission(&global(), "kick"), 1);

    perms.engine.uncache(&group_ref("admin"));
    let again = perms.user(PLAYER).await;
    assert!(Arc::ptr_eq(&user, &again));
    assert!(perms.engine.resident(&group_ref("admin")).is_some());
    assert_eq!(user.permission(&global(), "kick"), 1);
}

#[tokio::test]
async fn test_dropped_parent_stops_notifying() {
    let perms = PermsTest::start().await.unwrap();
    let user = perms.user(PLAYER).await;
    user.update(false, |d| d.add_parent(&global(), group_ref("old")))
        .await
        .unwrap();
    assert_eq!(user.parents(&global()), vec![group_ref("old")]);

    user.update(false, |d| d.remove_parent(&global(), &group_ref("old")))
        .await
        .unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = fired.clone();
    user.register_listener(move |_| {
        fired_clone.fetch_add(1, Ordering::SeqCst);
    });
    assert!(user.parents(&global()).is_empty());

    let old = perms.group("old").await;
    old.update(false, |d| d.set_permission(&global(), "kick", 1))
        .await
        .unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(user.permission(&global(), "kick"), 0);
}

#[tokio::test]
async fn test_concurrent_updates_lose_nothing() {
    let perms = PermsTest::start().await.unwrap();
    let group = perms.group("counter").await;

    let updates = (0..10).map(|_| {
        group.update(false, |d: &ImmutableSubjectData| {
            let next = d
                .option(&global(), "count")
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0)
                + 1;
            d.set_option(&global(), "count", Some(&next.to_string()))
        })
    });
    for result in join_all(updates).await {
        result.unwrap();
    }
    assert_eq!(group.option(&global(), "count").as_deref(), Some("10"));

    let stored = perms
        .store
        .snapshot()
        .await
        .subjects
        .remove(&group_ref("counter"))
        .unwrap();
    assert_eq!(stored.option(&global(), "count"), Some("10"));
}

#[tokio::test]
async fn test_reload_picks_up_external_changes() {
    let perms = PermsTest::start().await.unwrap();
    let group = perms.group("external").await;
    assert_eq!(group.permission(&global(), "x"), 0);

    let data = ImmutableSubjectData::new().set_permission(&global(), "x", 1);
    permsd::DataStore::set_data(perms.store.as_ref(), &group_ref("external"), Some(&data))
        .await
        .unwrap();
    assert_eq!(group.permission(&global(), "x"), 0);

    let change = perms.engine.reload(&group_ref("external")).await.unwrap();
    assert!(change.changed());
    assert_eq!(group.permission(&global(), "x"), 1);
}

#[tokio::test]
async fn test_debug_mode_checks_still_resolve() {
    let config = EngineConfig {
        debug: true,
        ..EngineConfig::default()
    };
    let perms = PermsTest::with_config(config).await.unwrap();
    let group = perms.group("logged").await;
    group
        .update(false, |d| d.set_permission(&global(), "x", 1))
        .await
        .unwrap();
    assert!(group.has_permission(&global(), "x"));
}

#[tokio::test]
async fn test_custom_context_reads_associated_object() {
    let perms = PermsTest::start().await.unwrap();
    perms.engine.register_context_definition(
        SimpleContextDefinition::new("world").with_current(|subject| {
            subject
                .associated_object()
                .and_then(|obj| obj.downcast_ref::<String>().cloned())
                .into_iter()
                .collect()
        }),
    );

    let user = perms.user(PLAYER).await;
    assert!(user.active_contexts().get("world").is_none());

    user.set_associated_object(Some(Arc::new(String::from("nether"))));
    let active = user.active_contexts();
    assert!(active.contains(&ContextValue::new("world", "nether")));

    user.update(false, |d| d.set_permission(&world("nether"), "build", 1))
        .await
        .unwrap();
    assert_eq!(user.permission(&active, "build"), 1);
}
