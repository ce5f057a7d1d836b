use super::*;
use crate::data::BackendError;
use crate::models::{ChangeEvent, Row};
use crate::services::backend::{
    BackendResult, ChangeFeed, Filter, MemoryBackend, Operation, SelectQuery,
};
use crate::services::registry::CacheRegistry;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn rows(value: Value) -> Vec<Row> {
    value
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect()
}

/// posts.author → users，users.posts → posts（环形关系）
struct Blog {
    backend: Arc<MemoryBackend>,
    _registry: Arc<CacheRegistry>,
    posts: Arc<EntityCache>,
    users: Arc<EntityCache>,
}

fn blog_with_config(config: CacheConfig) -> Blog {
    let backend = Arc::new(MemoryBackend::new());
    backend.link("posts", "author_id", "users");

    let registry = CacheRegistry::new(backend.clone(), config);
    let posts = registry
        .define("posts", [RelationDef::one("author", "users", registry.lazy("users"))])
        .unwrap()
        .get()
        .unwrap();
    let users = registry
        .define("users", [RelationDef::many("posts", "posts", registry.lazy("posts"))])
        .unwrap()
        .get()
        .unwrap();

    Blog {
        backend,
        _registry: registry,
        posts,
        users,
    }
}

fn blog() -> Blog {
    blog_with_config(CacheConfig::default())
}

/// 所有操作返回固定行的后端；变更流一打开就关闭
#[derive(Default)]
struct StaticBackend {
    rows: Vec<Row>,
}

#[async_trait]
impl Backend for StaticBackend {
    async fn select(&self, _table: &str, _query: &SelectQuery) -> BackendResult<Vec<Row>> {
        Ok(self.rows.clone())
    }

    async fn insert(&self, _table: &str, _row: Row) -> BackendResult<Vec<Row>> {
        Ok(self.rows.clone())
    }

    async fn update(&self, _table: &str, _patch: Row, _filter: &Filter) -> BackendResult<Vec<Row>> {
        Ok(self.rows.clone())
    }

    async fn delete(&self, _table: &str, _filter: &Filter) -> BackendResult<Vec<Row>> {
        Ok(self.rows.clone())
    }

    async fn subscribe(&self, _table: &str) -> BackendResult<ChangeFeed> {
        let (_tx, feed) = ChangeFeed::channel();
        Ok(feed)
    }
}

fn never_called() -> CacheFactory {
    Arc::new(|| Err(CacheError::UnknownCache("unused".to_string())))
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ==================== 归一化 ====================

#[test]
fn test_add_merges_in_place() {
    let blog = blog();
    let first = blog
        .posts
        .add(rows(json!([{"id": 1, "title": "a", "body": "x"}])))
        .unwrap();
    let second = blog
        .posts
        .add(rows(json!([{"id": 1, "title": "b"}])))
        .unwrap();

    assert!(first[0].same_entity(&second[0]));
    assert_eq!(first[0].get("title"), Some(json!("b")));
    assert_eq!(first[0].get("body"), Some(json!("x")));
    assert_eq!(blog.posts.len(), 1);
}

#[test]
fn test_add_keeps_input_order() {
    let blog = blog();
    let entities = blog
        .posts
        .add(rows(json!([{"id": 3}, {"id": 1}, {"id": 2}])))
        .unwrap();

    let ids: Vec<EntityId> = entities.iter().map(|e| e.id().clone()).collect();
    assert_eq!(ids, vec![3.into(), 1.into(), 2.into()]);
}

#[test]
fn test_add_requires_id() {
    let blog = blog();
    let err = blog.posts.add(rows(json!([{"title": "no id"}]))).unwrap_err();
    assert!(matches!(err, CacheError::InvalidRecord(_)));
    assert!(blog.posts.is_empty());
}

#[test]
fn test_nested_payload_is_normalized() {
    let blog = blog();
    let posts = blog
        .posts
        .add(rows(json!([{"id": 1, "title": "t", "users": {"id": 9, "name": "Ann"}}])))
        .unwrap();

    let post = &posts[0];
    assert_eq!(post.get("users"), None);
    assert_eq!(post.get("title"), Some(json!("t")));

    let author = post.related_one("author").unwrap();
    let cached = blog.users.peek(9).unwrap();
    assert!(author.same_entity(&cached));
    assert_eq!(cached.get("name"), Some(json!("Ann")));
    assert_eq!(blog.users.len(), 1);

    let rendered = post.to_json();
    assert_eq!(rendered["author"]["name"], json!("Ann"));
}

#[test]
fn test_shared_child_is_not_duplicated() {
    let blog = blog();
    let posts = blog
        .posts
        .add(rows(json!([
            {"id": 1, "users": {"id": 9, "name": "Ann"}},
            {"id": 2, "users": {"id": 9, "name": "Anne"}}
        ])))
        .unwrap();

    assert_eq!(blog.users.len(), 1);
    let a = posts[0].related_one("author").unwrap();
    let b = posts[1].related_one("author").unwrap();
    assert!(a.same_entity(&b));
    assert_eq!(a.get("name"), Some(json!("Anne")));
}

#[test]
fn test_one_to_many_payload() {
    let blog = blog();
    let users = blog
        .users
        .add(rows(json!([{"id": 9, "posts": [{"id": 1}, {"id": 2}]}])))
        .unwrap();

    let posts = users[0].related_many("posts");
    assert_eq!(posts.len(), 2);
    assert_eq!(blog.posts.len(), 2);
    assert!(posts[1].same_entity(&blog.posts.peek(2).unwrap()));
}

#[test]
fn test_cardinality_mismatch() {
    let blog = blog();

    let err = blog
        .posts
        .add(rows(json!([{"id": 1, "users": [{"id": 9}]}])))
        .unwrap_err();
    assert!(matches!(err, CacheError::Schema(_)));

    let err = blog
        .users
        .add(rows(json!([{"id": 9, "posts": {"id": 1}}])))
        .unwrap_err();
    assert!(matches!(err, CacheError::Schema(_)));

    // 父记录在关系全部成功前不会写入
    assert!(blog.posts.peek(1).is_none());
    assert!(blog.users.peek(9).is_none());
}

#[test]
fn test_null_payload_is_skipped() {
    let blog = blog();
    let posts = blog
        .posts
        .add(rows(json!([{"id": 1, "users": null}])))
        .unwrap();

    assert!(posts[0].related("author").is_none());
    assert_eq!(posts[0].get("users"), None);
    assert!(blog.users.is_empty());
}

#[test]
fn test_self_referencing_relation() {
    let backend = Arc::new(MemoryBackend::new());
    let registry = CacheRegistry::new(backend, CacheConfig::default());
    let employees = registry
        .define(
            "employees",
            [RelationDef::one("manager", "employees", registry.lazy("employees"))],
        )
        .unwrap()
        .get()
        .unwrap();

    let added = employees
        .add(rows(json!([{"id": 1, "name": "dev", "employees": {"id": 2, "name": "boss"}}])))
        .unwrap();

    assert_eq!(employees.len(), 2);
    let manager = added[0].related_one("manager").unwrap();
    assert!(manager.same_entity(&employees.peek(2).unwrap()));
}

#[test]
fn test_relation_table_mismatch() {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let users = EntityCache::builder("users", backend.clone()).build().unwrap();
    let posts = EntityCache::builder("posts", backend)
        .relation(RelationDef::one("author", "people", users.factory()))
        .build()
        .unwrap();

    let err = posts
        .add(rows(json!([{"id": 1, "people": {"id": 9}}])))
        .unwrap_err();
    assert!(matches!(err, CacheError::Schema(_)));
}

#[test]
fn test_remove_is_local() {
    let blog = blog();
    blog.posts.add(rows(json!([{"id": 1}]))).unwrap();

    assert!(blog.posts.remove(1).is_some());
    assert!(blog.posts.remove(1).is_none());
    assert!(blog.backend.calls().is_empty());
}

// ==================== 构建与选择表达式 ====================

#[test]
fn test_builder_rejects_duplicate_relation() {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let err = EntityCache::builder("posts", backend)
        .relation(RelationDef::one("author", "users", never_called()))
        .relation(RelationDef::one("author", "people", never_called()))
        .build()
        .unwrap_err();
    assert!(matches!(err, CacheError::Schema(_)));
}

#[test]
fn test_builder_rejects_invalid_placeholder_pattern() {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let config = CacheConfig {
        placeholder_pattern: "([".to_string(),
        ..Default::default()
    };
    let err = EntityCache::builder("posts", backend)
        .config(config)
        .build()
        .unwrap_err();
    assert!(matches!(err, CacheError::Config(_)));
}

#[test]
fn test_get_key_follows_caller_order() {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let posts = EntityCache::builder("posts", backend)
        .relation(RelationDef::one("author", "users", never_called()))
        .relation(RelationDef::many("comments", "comments", never_called()))
        .build()
        .unwrap();

    assert_eq!(posts.get_key::<&str>(None, &[]).unwrap(), "*");
    assert_eq!(
        posts.get_key(None, &["comments", "author"]).unwrap(),
        "*,comments(*),users(*)"
    );
    assert_eq!(
        posts.get_key(Some("id,title"), &["author"]).unwrap(),
        "id,title,users(*)"
    );

    let err = posts.get_key(None, &["tags"]).unwrap_err();
    assert!(matches!(
        err,
        CacheError::UnknownRelation { relation, .. } if relation == "tags"
    ));
}

// ==================== 读取 ====================

#[tokio::test]
async fn test_select_loads_once_per_key() {
    let blog = blog();
    blog.backend.seed("users", vec![json!({"id": 9, "name": "Ann"})]);
    blog.backend.seed(
        "posts",
        vec![
            json!({"id": 1, "title": "a", "author_id": 9}),
            json!({"id": 2, "title": "b", "author_id": 9}),
        ],
    );

    let first = blog.posts.select(&SelectOptions::default()).await.unwrap();
    let second = blog.posts.select(&SelectOptions::default()).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
    assert_eq!(blog.backend.call_count("posts", Operation::Select), 1);
    assert!(blog.posts.is_loaded("*"));

    let with_author = SelectOptions::include(["author"]);
    blog.posts.select(&with_author).await.unwrap();
    blog.posts.select(&with_author).await.unwrap();
    assert_eq!(blog.backend.call_count("posts", Operation::Select), 2);
    assert!(blog.posts.is_loaded("*,users(*)"));

    let calls = blog.backend.calls();
    assert_eq!(calls[1].query.as_ref().unwrap().columns, "*,users(*)");
}

#[tokio::test]
async fn test_select_end_to_end_with_relation() {
    let blog = blog();
    blog.backend.seed("users", vec![json!({"id": 9, "name": "Ann"})]);
    blog.backend
        .seed("posts", vec![json!({"id": 1, "title": "t", "author_id": 9})]);

    let posts = blog
        .posts
        .select(&SelectOptions::include(["author"]))
        .await
        .unwrap();

    let author = posts[0].related_one("author").unwrap();
    assert!(author.same_entity(&blog.users.peek(9).unwrap()));
    assert_eq!(blog.users.peek(9).unwrap().get("name"), Some(json!("Ann")));
    assert_eq!(posts[0].get("users"), None);
}

#[tokio::test]
async fn test_select_error_leaves_marker_unset() {
    let blog = blog();
    blog.backend
        .fail_next("posts", Operation::Select, BackendError::new("boom").with_code("500"));

    let err = blog.posts.select(&SelectOptions::default()).await.unwrap_err();
    assert!(err.is_backend());
    assert!(!blog.posts.is_loaded("*"));

    blog.posts.select(&SelectOptions::default()).await.unwrap();
    assert!(blog.posts.is_loaded("*"));
    assert_eq!(blog.backend.call_count("posts", Operation::Select), 2);
}

#[tokio::test]
async fn test_select_unknown_relation_makes_no_call() {
    let blog = blog();
    let err = blog
        .posts
        .select(&SelectOptions::include(["tags"]))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::UnknownRelation { .. }));
    assert!(blog.backend.calls().is_empty());
}

#[tokio::test]
async fn test_find_uses_cache_unless_reload() {
    let blog = blog();
    blog.backend
        .seed("posts", vec![json!({"id": 1, "title": "remote"})]);
    let local = blog
        .posts
        .add(rows(json!([{"id": 1, "title": "local"}])))
        .unwrap();

    let found = blog.posts.find(1, &FindOptions::default()).await.unwrap();
    assert!(found.same_entity(&local[0]));
    assert_eq!(blog.backend.call_count("posts", Operation::Select), 0);

    let reloaded = blog.posts.find(1, &FindOptions::reload()).await.unwrap();
    assert_eq!(blog.backend.call_count("posts", Operation::Select), 1);
    assert!(reloaded.same_entity(&local[0]));
    assert_eq!(local[0].get("title"), Some(json!("remote")));

    let call = &blog.backend.calls()[0];
    assert_eq!(call.query.as_ref().unwrap().filters, vec![Filter::eq("id", 1)]);
}

#[tokio::test]
async fn test_find_missing_is_not_found() {
    let blog = blog();
    let err = blog
        .posts
        .find(404, &FindOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::NotFound { ref id, .. } if id == "404"));
    assert_eq!(blog.backend.call_count("posts", Operation::Select), 1);
}

#[tokio::test]
async fn test_find_with_include() {
    let blog = blog();
    blog.backend.seed("users", vec![json!({"id": 9, "name": "Ann"})]);
    blog.backend
        .seed("posts", vec![json!({"id": 1, "author_id": 9})]);

    let post = blog
        .posts
        .find(1, &FindOptions::default().with_include(["author"]))
        .await
        .unwrap();
    assert!(post
        .related_one("author")
        .unwrap()
        .same_entity(&blog.users.peek(9).unwrap()));
}

#[tokio::test]
async fn test_query_refines_and_caches() {
    let blog = blog();
    blog.backend.seed(
        "posts",
        vec![
            json!({"id": 1, "status": "published"}),
            json!({"id": 2, "status": "draft"}),
            json!({"id": 3, "status": "published"}),
        ],
    );

    let published = blog
        .posts
        .query(
            |q| q.eq("status", "published").order("id", false),
            &SelectOptions::default(),
        )
        .await
        .unwrap();

    let ids: Vec<EntityId> = published.iter().map(|e| e.id().clone()).collect();
    assert_eq!(ids, vec![3.into(), 1.into()]);
    assert_eq!(blog.posts.len(), 2);
    assert!(!blog.posts.is_loaded("*"));
}

#[tokio::test]
async fn test_query_propagates_backend_error() {
    let blog = blog();
    blog.backend
        .fail_next("posts", Operation::Select, BackendError::new("bad filter"));

    let err = blog
        .posts
        .query(|q| q.eq("missing", 1), &SelectOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "bad filter");
}

#[test]
fn test_peek_accessors() {
    let blog = blog();
    assert!(blog.posts.peek(1).is_none());
    assert!(blog.posts.peek_all().is_empty());

    blog.posts.add(rows(json!([{"id": 1}, {"id": 2}]))).unwrap();
    assert!(blog.posts.peek(1).is_some());
    assert_eq!(blog.posts.peek_all().len(), 2);
    assert!(blog.backend.calls().is_empty());
}

// ==================== 写入 ====================

#[tokio::test]
async fn test_insert_caches_returned_row() {
    let blog = blog();
    let post = blog.posts.insert(row(json!({"title": "new"}))).await.unwrap();

    assert_eq!(post.id(), &EntityId::Int(1));
    assert!(post.same_entity(&blog.posts.peek(1).unwrap()));
    assert_eq!(blog.backend.rows("posts").len(), 1);
}

#[tokio::test]
async fn test_insert_without_returned_row_is_rejected() {
    let backend: Arc<dyn Backend> = Arc::new(StaticBackend::default());
    let posts = EntityCache::builder("posts", backend).build().unwrap();

    let err = posts.insert(row(json!({"title": "x"}))).await.unwrap_err();
    assert!(matches!(err, CacheError::Rejected { .. }));
    assert!(posts.is_empty());
}

#[tokio::test]
async fn test_update_merges_into_existing_reference() {
    let blog = blog();
    blog.backend
        .seed("posts", vec![json!({"id": 1, "title": "a", "body": "x"})]);
    let held = blog.posts.find(1, &FindOptions::default()).await.unwrap();

    let updated = blog
        .posts
        .update(1, row(json!({"title": "b"})))
        .await
        .unwrap();

    assert!(updated.same_entity(&held));
    assert_eq!(held.get("title"), Some(json!("b")));
    assert_eq!(held.get("body"), Some(json!("x")));
}

#[tokio::test]
async fn test_update_missing_is_not_found() {
    let blog = blog();
    let err = blog
        .posts
        .update(99, row(json!({"title": "b"})))
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::NotFound { .. }));
    assert!(blog.posts.is_empty());
}

#[tokio::test]
async fn test_update_backend_error_leaves_cache() {
    let blog = blog();
    blog.posts.add(rows(json!([{"id": 1, "title": "a"}]))).unwrap();
    blog.backend.fail_next(
        "posts",
        Operation::Update,
        BackendError::new("permission denied").with_code("42501"),
    );

    let err = blog
        .posts
        .update(1, row(json!({"title": "b"})))
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::Backend(ref e) if e.code.as_deref() == Some("42501")));
    assert_eq!(blog.posts.peek(1).unwrap().get("title"), Some(json!("a")));
}

#[tokio::test]
async fn test_update_many() {
    let blog = blog();
    blog.backend.seed(
        "posts",
        vec![
            json!({"id": 1, "status": "draft"}),
            json!({"id": 2, "status": "draft"}),
        ],
    );
    blog.posts.select(&SelectOptions::default()).await.unwrap();

    let ids = vec![EntityId::Int(1), EntityId::Int(2)];
    let updated = blog
        .posts
        .update_many(&ids, row(json!({"status": "archived"})))
        .await
        .unwrap();

    assert_eq!(updated.len(), 2);
    for id in &ids {
        assert_eq!(
            blog.posts.peek(id.clone()).unwrap().get("status"),
            Some(json!("archived"))
        );
    }
}

#[tokio::test]
async fn test_update_many_count_mismatch() {
    let blog = blog();
    blog.backend.seed(
        "posts",
        vec![
            json!({"id": 1, "status": "draft"}),
            json!({"id": 2, "status": "draft"}),
        ],
    );
    blog.posts.select(&SelectOptions::default()).await.unwrap();

    let ids = vec![EntityId::Int(1), EntityId::Int(2), EntityId::Int(3)];
    let err = blog
        .posts
        .update_many(&ids, row(json!({"status": "archived"})))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CacheError::PartialFailure { requested: 3, affected: 2, .. }
    ));
    assert_eq!(
        blog.posts.peek(1).unwrap().get("status"),
        Some(json!("draft"))
    );
}

#[tokio::test]
async fn test_update_many_collects_error_rows() {
    let backend: Arc<dyn Backend> = Arc::new(StaticBackend {
        rows: rows(json!([
            {"id": 1, "status": "archived"},
            {"id": 2, "error": {"message": "row locked"}}
        ])),
    });
    let posts = EntityCache::builder("posts", backend).build().unwrap();

    let ids = vec![EntityId::Int(1), EntityId::Int(2)];
    let err = posts
        .update_many(&ids, row(json!({"status": "archived"})))
        .await
        .unwrap_err();

    match err {
        CacheError::PartialFailure { errors, .. } => {
            assert_eq!(errors, vec![json!({"message": "row locked"})]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(posts.is_empty());
}

#[tokio::test]
async fn test_update_many_empty_is_noop() {
    let blog = blog();
    let updated = blog
        .posts
        .update_many(&[], row(json!({"status": "x"})))
        .await
        .unwrap();
    assert!(updated.is_empty());
    assert!(blog.backend.calls().is_empty());
}

#[tokio::test]
async fn test_delete_outcomes() {
    let blog = blog();
    blog.backend.seed(
        "posts",
        vec![
            json!({"id": 1}),
            // 重复主键：模拟一次删除影响多行
            json!({"id": 5, "copy": 1}),
            json!({"id": 5, "copy": 2}),
        ],
    );
    blog.posts.select(&SelectOptions::default()).await.unwrap();

    blog.posts.delete(1).await.unwrap();
    assert!(blog.posts.peek(1).is_none());

    let err = blog.posts.delete(1).await.unwrap_err();
    assert!(matches!(err, CacheError::NotFound { .. }));

    let err = blog.posts.delete(5).await.unwrap_err();
    assert!(matches!(err, CacheError::Integrity { affected: 2, .. }));
    assert!(blog.posts.peek(5).is_some());
}

#[tokio::test]
async fn test_delete_many() {
    let blog = blog();
    blog.backend.seed(
        "posts",
        vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})],
    );
    blog.posts.select(&SelectOptions::default()).await.unwrap();

    blog.posts
        .delete_many(&[EntityId::Int(1), EntityId::Int(2)])
        .await
        .unwrap();
    assert_eq!(blog.posts.len(), 1);

    let err = blog
        .posts
        .delete_many(&[EntityId::Int(3), EntityId::Int(99)])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CacheError::PartialFailure { requested: 2, affected: 1, .. }
    ));
    assert!(blog.posts.peek(3).is_some());
}

#[tokio::test]
async fn test_save_placeholder_inserts_without_id() {
    let blog = blog();
    let saved = blog
        .posts
        .save(row(json!({"id": "_new123", "title": "x"})))
        .await
        .unwrap();

    assert_eq!(blog.backend.call_count("posts", Operation::Insert), 1);
    assert_eq!(blog.backend.call_count("posts", Operation::Update), 0);
    assert_eq!(saved.id(), &EntityId::Int(1));
    assert_eq!(blog.backend.rows("posts")[0]["id"], json!(1));
}

#[tokio::test]
async fn test_save_generated_placeholder_inserts() {
    let blog = blog();
    let id = EntityId::placeholder(&blog.posts.config().placeholder_prefix);
    blog.posts
        .save(row(json!({"id": id.to_value(), "title": "x"})))
        .await
        .unwrap();
    assert_eq!(blog.backend.call_count("posts", Operation::Insert), 1);
}

#[tokio::test]
async fn test_save_existing_id_updates_and_strips_relations() {
    let blog = blog();
    blog.backend
        .seed("posts", vec![json!({"id": "42", "title": "old"})]);

    let saved = blog
        .posts
        .save(row(json!({
            "id": "42",
            "title": "x",
            "author": {"id": 9},
            "users": {"id": 9, "name": "Ann"}
        })))
        .await
        .unwrap();

    assert_eq!(blog.backend.call_count("posts", Operation::Update), 1);
    assert_eq!(blog.backend.call_count("posts", Operation::Insert), 0);
    let call = &blog.backend.calls()[0];
    assert_eq!(call.filter, Some(Filter::eq("id", "42")));

    let stored = &blog.backend.rows("posts")[0];
    assert!(stored.get("users").is_none());
    assert!(stored.get("author").is_none());
    assert_eq!(saved.get("title"), Some(json!("x")));
    assert!(blog.users.is_empty());
}

#[tokio::test]
async fn test_save_null_id_inserts() {
    let blog = blog();
    blog.posts
        .save(row(json!({"id": null, "title": "x"})))
        .await
        .unwrap();

    assert_eq!(blog.backend.call_count("posts", Operation::Insert), 1);
    assert_eq!(blog.backend.rows("posts")[0]["id"], json!(1));
}

#[tokio::test]
async fn test_save_zero_id_is_an_update() {
    let blog = blog();
    let err = blog
        .posts
        .save(row(json!({"id": 0, "title": "x"})))
        .await
        .unwrap_err();

    assert_eq!(blog.backend.call_count("posts", Operation::Update), 1);
    assert!(matches!(err, CacheError::NotFound { .. }));
}

#[tokio::test]
async fn test_concurrent_updates_on_different_ids() {
    let blog = blog();
    blog.backend.seed(
        "posts",
        vec![json!({"id": 1, "title": "a"}), json!({"id": 2, "title": "b"})],
    );
    blog.posts.select(&SelectOptions::default()).await.unwrap();

    let (first, second) = tokio::join!(
        blog.posts.update(1, row(json!({"title": "a2"}))),
        blog.posts.update(2, row(json!({"title": "b2"}))),
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(blog.posts.peek(1).unwrap().get("title"), Some(json!("a2")));
    assert_eq!(blog.posts.peek(2).unwrap().get("title"), Some(json!("b2")));
}

#[test]
fn test_version_guard_keeps_newer_record() {
    let blog = blog_with_config(CacheConfig {
        version_field: Some("version".to_string()),
        ..Default::default()
    });

    blog.posts
        .add(rows(json!([{"id": 1, "version": 2, "title": "new"}])))
        .unwrap();
    blog.posts
        .add(rows(json!([{"id": 1, "version": 1, "title": "old"}])))
        .unwrap();

    assert_eq!(blog.posts.peek(1).unwrap().get("title"), Some(json!("new")));
}

#[test]
fn test_stale_row_keeps_relations_and_children() {
    let blog = blog_with_config(CacheConfig {
        version_field: Some("version".to_string()),
        ..Default::default()
    });

    blog.posts
        .add(rows(json!([{"id": 1, "version": 2, "title": "new", "users": {"id": 9}}])))
        .unwrap();
    let stale = blog
        .posts
        .add(rows(json!([{"id": 1, "version": 1, "title": "old", "users": {"id": 8}}])))
        .unwrap();

    let post = blog.posts.peek(1).unwrap();
    assert!(stale[0].same_entity(&post));
    assert_eq!(post.get("title"), Some(json!("new")));
    assert_eq!(post.related_one("author").unwrap().id(), &EntityId::Int(9));
    // 更旧行中的子实体同样不写入
    assert!(blog.users.peek(8).is_none());
}

// ==================== 实时同步 ====================

#[tokio::test]
async fn test_realtime_applies_changes() {
    let blog = blog();
    blog.posts.subscribe().await.unwrap();
    assert!(blog.posts.is_subscribed());
    assert_eq!(blog.backend.subscriber_count("posts"), 1);

    let mut events = blog.posts.watch();
    blog.backend
        .emit(ChangeEvent::insert("posts", row(json!({"id": 5, "title": "pushed"}))));
    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, StoreEvent::Upserted { id: 5.into() });
    assert_eq!(blog.posts.peek(5).unwrap().get("title"), Some(json!("pushed")));

    blog.backend.emit(ChangeEvent::update(
        "posts",
        row(json!({"id": 5, "title": "edited"})),
        row(json!({"id": 5})),
    ));
    blog.backend
        .emit(ChangeEvent::delete("posts", row(json!({"id": 5}))));

    let mut seen = Vec::new();
    while seen.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(event);
    }
    assert_eq!(seen[1], StoreEvent::Removed { id: 5.into() });
    assert!(blog.posts.peek(5).is_none());
}

#[tokio::test]
async fn test_subscribe_twice_is_noop() {
    let blog = blog();
    blog.posts.subscribe().await.unwrap();
    blog.posts.subscribe().await.unwrap();

    assert_eq!(blog.backend.call_count("posts", Operation::Subscribe), 1);
    assert_eq!(blog.backend.subscriber_count("posts"), 1);
}

#[tokio::test]
async fn test_unsubscribe_stops_updates() {
    let blog = blog();
    blog.posts.unsubscribe().await;
    assert!(!blog.posts.is_subscribed());

    blog.posts.subscribe().await.unwrap();
    blog.posts.unsubscribe().await;
    assert!(!blog.posts.is_subscribed());
    assert_eq!(blog.backend.subscriber_count("posts"), 0);

    blog.backend
        .emit(ChangeEvent::insert("posts", row(json!({"id": 7}))));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(blog.posts.peek(7).is_none());

    // 再次取消订阅只是警告
    blog.posts.unsubscribe().await;
    assert!(!blog.posts.is_subscribed());
}

#[tokio::test]
async fn test_subscribe_failure_keeps_state() {
    let blog = blog();
    blog.backend.fail_next(
        "posts",
        Operation::Subscribe,
        BackendError::new("channel error"),
    );

    assert!(blog.posts.subscribe().await.is_err());
    assert!(!blog.posts.is_subscribed());

    blog.posts.subscribe().await.unwrap();
    assert!(blog.posts.is_subscribed());
}

#[tokio::test]
async fn test_closed_feed_clears_subscription() {
    let backend: Arc<dyn Backend> = Arc::new(StaticBackend::default());
    let posts = EntityCache::builder("posts", backend).build().unwrap();

    posts.subscribe().await.unwrap();
    assert!(eventually(|| !posts.is_subscribed()).await);

    // 可以重新订阅
    posts.subscribe().await.unwrap();
}

#[tokio::test]
async fn test_dropping_cache_stops_feed() {
    let backend = Arc::new(MemoryBackend::new());
    let posts = EntityCache::builder("posts", backend.clone()).build().unwrap();

    posts.subscribe().await.unwrap();
    assert_eq!(backend.subscriber_count("posts"), 1);

    drop(posts);
    assert!(eventually(|| backend.subscriber_count("posts") == 0).await);
}

#[tokio::test]
async fn test_realtime_races_with_update() {
    let blog = blog();
    blog.backend
        .seed("posts", vec![json!({"id": 1, "title": "a", "views": 0})]);
    blog.posts.select(&SelectOptions::default()).await.unwrap();
    blog.posts.subscribe().await.unwrap();

    blog.posts
        .update(1, row(json!({"title": "b"})))
        .await
        .unwrap();

    // 自己写入产生的变更事件回流后与本地状态一致
    let held = blog.posts.peek(1).unwrap();
    assert!(eventually(|| held.get("title") == Some(json!("b"))).await);
    assert_eq!(held.get("views"), Some(json!(0)));
}

#[test]
fn test_apply_change_ignores_other_schema() {
    let blog = blog();
    let mut event = ChangeEvent::insert("posts", row(json!({"id": 1})));
    event.schema = "audit".to_string();

    blog.posts.apply_change(event).unwrap();
    assert!(blog.posts.is_empty());

    blog.posts
        .apply_change(ChangeEvent::delete("posts", row(json!({"title": "no id"}))))
        .unwrap();
}

// ==================== 主键类型 ====================

/// 按列类型解析过滤值的后端：过滤值 "42" 命中整数列，返回整数主键
fn integer_keyed(ids: &[i64]) -> Arc<EntityCache> {
    let backend = StaticBackend {
        rows: ids.iter().map(|id| row(json!({"id": id, "title": "t"}))).collect(),
    };
    EntityCache::builder("posts", Arc::new(backend)).build().unwrap()
}

#[tokio::test]
async fn test_text_id_finds_integer_row() {
    let posts = integer_keyed(&[42]);

    let found = posts.find("42", &FindOptions::default()).await.unwrap();
    assert_eq!(found.id(), &EntityId::Int(42));
    assert_eq!(posts.len(), 1);

    // 再次查找命中同一槽位
    let again = posts.find(42, &FindOptions::default()).await.unwrap();
    assert!(found.same_entity(&again));
}

#[tokio::test]
async fn test_text_id_delete_removes_integer_row() {
    let posts = integer_keyed(&[42]);
    posts.add(rows(json!([{"id": 42}]))).unwrap();

    posts.delete("42").await.unwrap();
    assert!(posts.peek(42).is_none());
    assert!(posts.is_empty());
}

#[tokio::test]
async fn test_text_ids_in_bulk_operations() {
    let posts = integer_keyed(&[1, 2]);
    let ids = vec![EntityId::from("1"), EntityId::from("2")];

    let updated = posts.update_many(&ids, row(json!({"title": "t"}))).await.unwrap();
    assert_eq!(updated.len(), 2);
    assert_eq!(updated[0].id(), &EntityId::Int(1));

    posts.delete_many(&ids).await.unwrap();
    assert!(posts.is_empty());
}

#[tokio::test]
async fn test_save_text_id_updates_integer_row() {
    let posts = integer_keyed(&[42]);
    posts.add(rows(json!([{"id": 42, "title": "old"}]))).unwrap();
    let held = posts.peek(42).unwrap();

    let saved = posts.save(row(json!({"id": "42", "title": "t"}))).await.unwrap();
    assert!(saved.same_entity(&held));
    assert_eq!(posts.len(), 1);
}
