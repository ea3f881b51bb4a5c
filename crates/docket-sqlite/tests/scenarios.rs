use docket_core::{
    field, Column, CompiledQuery, DescribeContext, DocketError, Entity, Index, IndexDescriptor,
    IndexProvider, Result, Session, Store, Value,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Article {
    id: i64,
    title: String,
    published: String,
    author: Option<String>,
}

impl Entity for Article {
    const TYPE: &'static str = "Article";

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Author {
    id: i64,
    name: String,
    active: bool,
}

impl Entity for Author {
    const TYPE: &'static str = "Author";

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ArticleByTitle {
    title: String,
    author: Option<String>,
}

impl Index for ArticleByTitle {
    const NAME: &'static str = "ArticleByTitle";
    const COLUMNS: &'static [Column] = &[Column::text("title"), Column::text("author").nullable()];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ArticlesByDay {
    day: String,
    count: i64,
}

impl Index for ArticlesByDay {
    const NAME: &'static str = "ArticlesByDay";
    const COLUMNS: &'static [Column] = &[Column::text("day"), Column::integer("count")];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AuthorByName {
    name: String,
    active: bool,
}

impl Index for AuthorByName {
    const NAME: &'static str = "AuthorByName";
    const COLUMNS: &'static [Column] = &[Column::text("name"), Column::boolean("active")];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Post {
    id: i64,
    day: String,
    words: i64,
}

impl Entity for Post {
    const TYPE: &'static str = "Post";

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WordsByDay {
    day: String,
    total: i64,
}

impl Index for WordsByDay {
    const NAME: &'static str = "WordsByDay";
    const COLUMNS: &'static [Column] = &[Column::text("day"), Column::integer("total")];
}

struct Indexes;

impl IndexProvider for Indexes {
    fn describe(&self, ctx: &mut DescribeContext) -> Result<()> {
        ctx.add(IndexDescriptor::map(|a: &Article| {
            vec![ArticleByTitle {
                title: a.title.clone(),
                author: a.author.clone(),
            }]
        }))?;
        ctx.add(
            IndexDescriptor::map(|a: &Article| {
                vec![ArticlesByDay {
                    day: a.published.clone(),
                    count: 1,
                }]
            })
            .group_by("day")
            .reduce(|rows: Vec<ArticlesByDay>| {
                let first = rows.first()?.clone();
                Some(ArticlesByDay {
                    count: rows.iter().map(|r| r.count).sum(),
                    ..first
                })
            })
            .delete(|current: ArticlesByDay, removed: Vec<ArticlesByDay>| {
                let count = current.count - removed.iter().map(|r| r.count).sum::<i64>();
                (count > 0).then_some(ArticlesByDay { count, ..current })
            }),
        )?;
        ctx.add(IndexDescriptor::map(|a: &Author| {
            vec![AuthorByName {
                name: a.name.clone(),
                active: a.active,
            }]
        }))?;
        ctx.add(
            IndexDescriptor::map(|p: &Post| {
                vec![WordsByDay {
                    day: p.day.clone(),
                    total: p.words,
                }]
            })
            .group_by("day")
            .reduce(|rows: Vec<WordsByDay>| {
                let first = rows.first()?.clone();
                Some(WordsByDay {
                    total: rows.iter().map(|r| r.total).sum(),
                    ..first
                })
            })
            .delete(|current: WordsByDay, removed: Vec<WordsByDay>| {
                Some(WordsByDay {
                    total: current.total - removed.iter().map(|r| r.total).sum::<i64>(),
                    ..current
                })
            })
            .update(|current: WordsByDay, updated: Vec<WordsByDay>| WordsByDay {
                total: current.total + updated.iter().map(|r| r.total).sum::<i64>(),
                ..current
            }),
        )
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn open(dir: &TempDir) -> Store {
    init_tracing();
    let store = docket_sqlite::store(dir.path().join("docket.db"))
        .provider(Indexes)
        .build();
    store
        .execute_schema("", |s| {
            s.create_document_table()
                .create_map_index_table::<ArticleByTitle>()
                .create_reduce_index_table::<ArticlesByDay>()
                .create_map_index_table::<AuthorByName>()
                .create_reduce_index_table::<WordsByDay>();
        })
        .await
        .unwrap();
    store.initialize_collection("").await.unwrap();
    store
}

fn article(title: &str, day: u32, author: Option<&str>) -> Article {
    Article {
        id: 0,
        title: title.to_string(),
        published: format!("2024-05-0{day}"),
        author: author.map(String::from),
    }
}

/// Ten articles over four days: four on day 1, three on day 2, two on day 3,
/// one on day 4.
async fn seed(store: &Store) -> Vec<Article> {
    let mut session = store.session().await.unwrap();
    let mut saved = Vec::new();
    for (day, n) in [(1, 4), (2, 3), (3, 2), (4, 1)] {
        for i in 0..n {
            let mut a = article(&format!("day{day}-{i}"), day, None);
            session.save(&mut a).await.unwrap();
            saved.push(a);
        }
    }
    session.save_changes().await.unwrap();
    saved
}

async fn day_counts(session: &Session) -> Vec<(String, i64)> {
    let mut rows: Vec<(String, i64)> = session
        .query_index::<ArticlesByDay>()
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.day, r.count))
        .collect();
    rows.sort();
    rows
}

fn count_rows(dir: &TempDir, table: &str) -> i64 {
    let conn = rusqlite::Connection::open(dir.path().join("docket.db")).unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |r| r.get(0))
        .unwrap()
}

fn day(n: u32) -> String {
    format!("2024-05-0{n}")
}

#[tokio::test]
async fn ten_articles_reduce_into_four_day_rows() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;
    seed(&store).await;

    let session = store.session().await.unwrap();
    let counts = day_counts(&session).await;
    assert_eq!(
        counts,
        vec![(day(1), 4), (day(2), 3), (day(3), 2), (day(4), 1)]
    );
    assert_eq!(counts.iter().map(|(_, c)| c).sum::<i64>(), 10);
    assert_eq!(count_rows(&dir, "ArticlesByDay_Document"), 10);

    let mut on_day_two = session
        .query::<Article>()
        .with::<ArticlesByDay>(field::<ArticlesByDay>("day").eq(day(2)))
        .list()
        .await
        .unwrap();
    on_day_two.sort_by_key(|a| a.id);
    assert_eq!(on_day_two.len(), 3);
    assert!(on_day_two.iter().all(|a| a.published == day(2)));
}

#[tokio::test]
async fn moving_an_article_shifts_one_unit_between_days() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;
    let seeded = seed(&store).await;
    let moved = seeded.iter().find(|a| a.published == day(2)).unwrap();

    let mut session = store.session().await.unwrap();
    let mut a: Article = session.get(moved.id).await.unwrap().unwrap();
    a.published = day(3);
    session.save(&mut a).await.unwrap();
    session.save_changes().await.unwrap();

    let session = store.session().await.unwrap();
    assert_eq!(
        day_counts(&session).await,
        vec![(day(1), 4), (day(2), 2), (day(3), 3), (day(4), 1)]
    );
    assert_eq!(count_rows(&dir, "ArticlesByDay_Document"), 10);
}

#[tokio::test]
async fn moving_the_only_article_of_a_day_removes_its_row() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;
    let seeded = seed(&store).await;
    let lonely = seeded.iter().find(|a| a.published == day(4)).unwrap();

    let mut session = store.session().await.unwrap();
    let mut a: Article = session.get(lonely.id).await.unwrap().unwrap();
    a.published = day(1);
    session.save(&mut a).await.unwrap();
    session.save_changes().await.unwrap();

    let session = store.session().await.unwrap();
    assert_eq!(
        day_counts(&session).await,
        vec![(day(1), 5), (day(2), 3), (day(3), 2)]
    );
}

#[tokio::test]
async fn deleting_every_contributor_leaves_no_orphans() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;
    let seeded = seed(&store).await;

    let mut session = store.session().await.unwrap();
    for a in seeded.iter().filter(|a| a.published == day(3)) {
        session.delete(a).await.unwrap();
    }
    session.save_changes().await.unwrap();

    let session = store.session().await.unwrap();
    let counts = day_counts(&session).await;
    assert!(counts.iter().all(|(d, _)| *d != day(3)));
    assert_eq!(counts.len(), 3);
    assert_eq!(count_rows(&dir, "ArticlesByDay_Document"), 8);
    assert_eq!(count_rows(&dir, "ArticleByTitle"), 8);
    assert_eq!(count_rows(&dir, "Document"), 8);
}

#[tokio::test]
async fn save_then_delete_before_flush_leaves_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;

    let mut session = store.session().await.unwrap();
    let mut a = article("draft", 1, None);
    session.save(&mut a).await.unwrap();
    session.delete(&a).await.unwrap();
    session.save_changes().await.unwrap();

    for table in ["Document", "ArticleByTitle", "ArticlesByDay", "ArticlesByDay_Document"] {
        assert_eq!(count_rows(&dir, table), 0, "{table}");
    }
}

#[tokio::test]
async fn map_rows_follow_their_document() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;

    let mut session = store.session().await.unwrap();
    let mut a = article("first", 1, Some("ada"));
    session.save(&mut a).await.unwrap();
    session.save_changes().await.unwrap();

    a.title = "second".into();
    session.save(&mut a).await.unwrap();
    session.save_changes().await.unwrap();
    let titles = session.query_index::<ArticleByTitle>().list().await.unwrap();
    assert_eq!(
        titles,
        vec![ArticleByTitle {
            title: "second".into(),
            author: Some("ada".into()),
        }]
    );

    session.delete(&a).await.unwrap();
    session.save_changes().await.unwrap();
    assert_eq!(count_rows(&dir, "ArticleByTitle"), 0);
    assert!(session.get::<Article>(a.id).await.unwrap().is_none());
}

#[tokio::test]
async fn null_comparisons_become_is_null() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;

    let mut session = store.session().await.unwrap();
    for (title, author) in [("a", None), ("b", Some("ada")), ("c", None)] {
        session.save(&mut article(title, 1, author)).await.unwrap();
    }
    session.save_changes().await.unwrap();

    let anonymous = session
        .query_index::<ArticleByTitle>()
        .filter(field::<ArticleByTitle>("author").eq(None::<String>));
    let (sql, _) = anonymous.to_sql().unwrap();
    assert!(sql.contains("IS NULL"));
    assert_eq!(anonymous.count().await.unwrap(), 2);

    let signed = session
        .query_index::<ArticleByTitle>()
        .filter(field::<ArticleByTitle>("author").ne(None::<String>))
        .list()
        .await
        .unwrap();
    assert_eq!(signed.len(), 1);
    assert_eq!(signed[0].title, "b");
}

#[tokio::test]
async fn in_lists_of_every_size() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;
    seed(&store).await;
    let session = store.session().await.unwrap();

    let count = |titles: Vec<&'static str>| {
        session
            .query_index::<ArticleByTitle>()
            .filter(field::<ArticleByTitle>("title").is_in(titles))
            .count()
    };
    assert_eq!(count(vec![]).await.unwrap(), 0);
    assert_eq!(count(vec!["day1-0"]).await.unwrap(), 1);
    assert_eq!(count(vec!["day1-0", "day2-1", "missing"]).await.unwrap(), 2);

    let rest = session
        .query_index::<ArticleByTitle>()
        .filter(field::<ArticleByTitle>("title").is_not_in(["day1-0", "day1-1"]))
        .count()
        .await
        .unwrap();
    assert_eq!(rest, 8);
}

#[tokio::test]
async fn correlated_membership_runs_as_one_statement() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;

    let mut session = store.session().await.unwrap();
    for (name, active) in [("ada", true), ("bob", false)] {
        let mut author = Author {
            id: 0,
            name: name.into(),
            active,
        };
        session.save(&mut author).await.unwrap();
    }
    for (title, author) in [("x", Some("ada")), ("y", Some("bob")), ("z", None)] {
        session.save(&mut article(title, 1, author)).await.unwrap();
    }
    session.save_changes().await.unwrap();

    let query = session.query_index::<ArticleByTitle>().filter(
        field::<ArticleByTitle>("author")
            .is_in_query::<AuthorByName>("name", field::<AuthorByName>("active").eq(true)),
    );
    let (sql, _) = query.to_sql().unwrap();
    assert_eq!(sql.matches("SELECT").count(), 2);
    let rows = query.list().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].title, "x");
}

#[tokio::test]
async fn documents_order_by_their_index_columns() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;
    seed(&store).await;
    let session = store.session().await.unwrap();

    let titles: Vec<String> = session
        .query::<Article>()
        .with::<ArticleByTitle>(field::<ArticleByTitle>("title").starts_with("day1"))
        .order_by_descending(field::<ArticleByTitle>("title"))
        .take(2)
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.title)
        .collect();
    assert_eq!(titles, vec!["day1-3", "day1-2"]);
}

struct DayArgs {
    day: String,
}

#[tokio::test]
async fn compiled_queries_rebind_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;
    seed(&store).await;
    let session = store.session().await.unwrap();

    let by_day = CompiledQuery::<DayArgs, ArticlesByDay>::new(|args| {
        field::<ArticlesByDay>("day").eq(args.get("day", |a: &DayArgs| Value::from(a.day.clone())))
    })
    .unwrap();

    for (n, expected) in [(1, 4), (3, 2)] {
        let rows = session
            .query_compiled(&by_day, &DayArgs { day: day(n) })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].count, expected);
    }
}

#[tokio::test]
async fn stale_updates_raise_a_concurrency_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;
    let seeded = seed(&store).await;
    let id = seeded[0].id;

    let mut first = store.session().await.unwrap();
    let mut second = store.session().await.unwrap();
    let mut mine: Article = first.get(id).await.unwrap().unwrap();
    let mut theirs: Article = second.get(id).await.unwrap().unwrap();

    mine.title = "mine".into();
    first.save(&mut mine).await.unwrap();
    first.save_changes().await.unwrap();

    theirs.title = "theirs".into();
    second.save(&mut theirs).await.unwrap();
    let err = second.save_changes().await.unwrap_err();
    assert!(err.is_concurrency_conflict());
    assert!(second.is_cancelled());
    second.close().await.unwrap();

    let check = store.session().await.unwrap();
    let stored: Article = check.get(id).await.unwrap().unwrap();
    assert_eq!(stored.title, "mine");
}

#[tokio::test]
async fn cancelled_sessions_roll_back_flushed_work() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;

    let mut session = store.session().await.unwrap();
    session.save(&mut article("gone", 2, None)).await.unwrap();
    session.flush().await.unwrap();
    session.cancel();
    session.save_changes().await.unwrap();

    assert_eq!(count_rows(&dir, "Document"), 0);
    assert_eq!(count_rows(&dir, "ArticlesByDay"), 0);
}

#[tokio::test]
async fn reopened_stores_continue_the_id_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;
    let seeded = seed(&store).await;
    let highest = seeded.iter().map(|a| a.id).max().unwrap();
    drop(store);

    let store = open(&dir).await;
    let mut session = store.session().await.unwrap();
    let mut a = article("late", 4, None);
    session.save(&mut a).await.unwrap();
    session.save_changes().await.unwrap();
    assert_eq!(a.id, highest + 1);
}

#[tokio::test]
async fn collections_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;
    store
        .execute_schema("Archive", |s| {
            s.create_document_table();
        })
        .await
        .unwrap();
    store.initialize_collection("Archive").await.unwrap();

    let mut session = store.session().await.unwrap();
    let mut a = article("old", 1, None);
    session.save_in("Archive", &mut a).await.unwrap();
    session.save_changes().await.unwrap();

    let session = store.session().await.unwrap();
    assert!(session.get_in::<Article>("Archive", a.id).await.unwrap().is_some());
    assert_eq!(session.query::<Article>().count().await.unwrap(), 0);
    assert_eq!(count_rows(&dir, "Archive_Document"), 1);
}

async fn words_by_day(session: &Session) -> Vec<WordsByDay> {
    let mut rows = session.query_index::<WordsByDay>().list().await.unwrap();
    rows.sort_by(|a, b| a.day.cmp(&b.day));
    rows
}

#[tokio::test]
async fn editing_within_a_group_replaces_the_old_contribution() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;

    let mut session = store.session().await.unwrap();
    let mut post = Post {
        id: 0,
        day: "d1".into(),
        words: 5,
    };
    let mut other = Post {
        id: 0,
        day: "d1".into(),
        words: 3,
    };
    session.save(&mut post).await.unwrap();
    session.save(&mut other).await.unwrap();
    session.save_changes().await.unwrap();

    post.words = 7;
    session.save(&mut post).await.unwrap();
    session.save_changes().await.unwrap();

    let session = store.session().await.unwrap();
    assert_eq!(
        words_by_day(&session).await,
        vec![WordsByDay {
            day: "d1".into(),
            total: 10,
        }]
    );
    assert_eq!(count_rows(&dir, "WordsByDay_Document"), 2);
}

#[tokio::test]
async fn stores_opened_over_existing_data_do_not_reuse_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;
    let seeded = seed(&store).await;
    let highest = seeded.iter().map(|a| a.id).max().unwrap();
    drop(store);

    let store = docket_sqlite::store(dir.path().join("docket.db"))
        .provider(Indexes)
        .build();
    let mut session = store.session().await.unwrap();
    let mut a = article("fresh", 2, None);
    session.save(&mut a).await.unwrap();
    session.save_changes().await.unwrap();
    assert_eq!(a.id, highest + 1);

    let mut chosen = article("chosen", 2, None);
    chosen.id = highest + 50;
    session.save(&mut chosen).await.unwrap();
    let mut next = article("next", 2, None);
    session.save(&mut next).await.unwrap();
    session.save_changes().await.unwrap();
    assert_eq!(next.id, highest + 51);
    assert_eq!(count_rows(&dir, "Document"), 13);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Tag {
    id: i64,
    name: String,
}

impl Entity for Tag {
    const TYPE: &'static str = "Tag";

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TagCounts {
    name: String,
    count: i64,
}

impl Index for TagCounts {
    const NAME: &'static str = "TagCounts";
    const COLUMNS: &'static [Column] = &[Column::text("name"), Column::integer("count")];
}

/// Refuses to aggregate unnamed tags.
struct Tags;

impl IndexProvider for Tags {
    fn describe(&self, ctx: &mut DescribeContext) -> Result<()> {
        ctx.add(
            IndexDescriptor::map(|t: &Tag| {
                vec![TagCounts {
                    name: t.name.clone(),
                    count: 1,
                }]
            })
            .group_by("name")
            .reduce(|rows: Vec<TagCounts>| {
                let first = rows.first()?.clone();
                if first.name.is_empty() {
                    return None;
                }
                Some(TagCounts {
                    count: rows.iter().map(|r| r.count).sum(),
                    ..first
                })
            }),
        )
    }
}

#[tokio::test]
async fn empty_reduce_results_abort_the_whole_unit_of_work() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;
    store.register(Tags);
    store
        .execute_schema("", |s| {
            s.create_reduce_index_table::<TagCounts>();
        })
        .await
        .unwrap();

    let mut session = store.session().await.unwrap();
    session
        .save(&mut Tag {
            id: 0,
            name: "rust".into(),
        })
        .await
        .unwrap();
    session.save_changes().await.unwrap();

    let mut session = store.session().await.unwrap();
    session.save(&mut article("kept?", 1, None)).await.unwrap();
    session.flush().await.unwrap();
    session
        .save(&mut Tag {
            id: 0,
            name: String::new(),
        })
        .await
        .unwrap();
    let err = session.save_changes().await.unwrap_err();
    assert!(matches!(err, DocketError::InvariantViolation(_)));
    assert!(session.is_cancelled());
    session.close().await.unwrap();

    assert_eq!(count_rows(&dir, "Document"), 1);
    assert_eq!(count_rows(&dir, "ArticleByTitle"), 0);
    assert_eq!(count_rows(&dir, "ArticlesByDay"), 0);
    assert_eq!(count_rows(&dir, "TagCounts"), 1);
    assert_eq!(count_rows(&dir, "TagCounts_Document"), 1);
    let session = store.session().await.unwrap();
    assert_eq!(
        session.query_index::<TagCounts>().list().await.unwrap(),
        vec![TagCounts {
            name: "rust".into(),
            count: 1,
        }]
    );
}
