//! Persistence of extracted job details into normalized tables, and the
//! reverse mapping back to the JSON shape the model produces.
//!
//! Categorical values are stored once per distinct trimmed string in small
//! lookup tables. Which JSON key maps to which table is fixed at compile time
//! by [`LOOKUP_FIELDS`] and [`SET_FIELDS`]; the schema is generated from the
//! same tables so the two cannot drift.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{Map, Number, Value};

/// A single-valued categorical attribute: `job_details.<target>` points into `<table>`.
pub struct LookupField {
    pub key: &'static str,
    pub table: &'static str,
    pub column: &'static str,
    pub target: &'static str,
}

/// A multi-valued categorical attribute linked through `<link>`.
pub struct SetField {
    pub key: &'static str,
    pub table: &'static str,
    pub column: &'static str,
    pub link: &'static str,
}

macro_rules! lookup {
    ($key:literal, $table:literal, $column:literal) => {
        LookupField {
            key: $key,
            table: $table,
            column: $column,
            target: concat!($key, "_id"),
        }
    };
}

macro_rules! set {
    ($key:literal, $table:literal, $column:literal) => {
        SetField {
            key: $key,
            table: $table,
            column: $column,
            link: concat!("detail_", $table),
        }
    };
}

pub const LOOKUP_FIELDS: &[LookupField] = &[
    lookup!("title", "titles", "name"),
    lookup!("job_function", "job_functions", "name"),
    lookup!("seniority_level", "seniority_levels", "name"),
    lookup!("industry", "industries", "name"),
    lookup!("department", "departments", "name"),
    lookup!("job_family", "job_families", "name"),
    lookup!("specialization", "specializations", "name"),
    lookup!("required_education", "education_levels", "name"),
    lookup!("employment_type", "employment_types", "name"),
    lookup!("contract_type", "contract_types", "name"),
    lookup!("work_schedule", "work_schedules", "name"),
    lookup!("shift_details", "shift_details", "name"),
    lookup!("remote_work", "remote_work_options", "name"),
    lookup!("travel_required", "travel_requirements", "name"),
    lookup!("salary_currency", "currencies", "code"),
    lookup!("salary_period", "salary_periods", "name"),
    lookup!("city", "cities", "name"),
    lookup!("region", "regions", "name"),
    lookup!("country", "countries", "name"),
    lookup!("full_address", "full_addresses", "address"),
    lookup!("company_name", "companies", "name"),
    lookup!("company_size", "company_sizes", "name"),
    lookup!("contact_person", "contact_persons", "name"),
];

pub const SET_FIELDS: &[SetField] = &[
    set!("hard_skills", "hard_skills", "name"),
    set!("soft_skills", "soft_skills", "name"),
    set!("certifications", "certifications", "name"),
    set!("licenses_required", "licenses", "name"),
    set!("benefits", "benefits", "description"),
    set!("work_environment", "work_environments", "description"),
    set!("professional_development", "professional_development", "description"),
    set!("work_life_balance", "work_life_balance", "description"),
    set!("physical_requirements", "physical_requirements", "description"),
    set!("work_conditions", "work_conditions", "description"),
    set!("special_requirements", "special_requirements", "description"),
];

pub const NUMBER_FIELDS: &[&str] = &["min_salary", "max_salary", "experience_years"];
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, thiserror::Error)]
pub enum DetailError {
    #[error("posting {0} already has extracted details")]
    AlreadyExists(i64),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

pub fn schema_sql() -> String {
    let mut sql = String::new();

    for (table, column) in LOOKUP_FIELDS
        .iter()
        .map(|f| (f.table, f.column))
        .chain(SET_FIELDS.iter().map(|f| (f.table, f.column)))
    {
        sql.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY,
                {column} TEXT NOT NULL UNIQUE
            );\n"
        ));
    }

    sql.push_str(
        "CREATE TABLE IF NOT EXISTS job_details (
            id INTEGER PRIMARY KEY,
            posting_id INTEGER NOT NULL UNIQUE REFERENCES postings(id),\n",
    );
    for f in LOOKUP_FIELDS {
        sql.push_str(&format!(
            "            {} INTEGER REFERENCES {}(id),\n",
            f.target, f.table
        ));
    }
    sql.push_str(
        "            min_salary REAL,
            max_salary REAL,
            experience_years REAL,
            original_language TEXT,
            posting_date TEXT,
            processed_at TEXT NOT NULL DEFAULT (datetime('now'))
        );\n",
    );

    for f in SET_FIELDS {
        sql.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {link} (
                detail_id INTEGER NOT NULL REFERENCES job_details(id),
                item_id INTEGER NOT NULL REFERENCES {table}(id),
                PRIMARY KEY (detail_id, item_id)
            );\n",
            link = f.link,
            table = f.table
        ));
    }

    sql.push_str(
        "CREATE TABLE IF NOT EXISTS responsibilities (
            id INTEGER PRIMARY KEY,
            detail_id INTEGER NOT NULL REFERENCES job_details(id),
            position INTEGER NOT NULL,
            description TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS job_languages (
            id INTEGER PRIMARY KEY,
            detail_id INTEGER NOT NULL REFERENCES job_details(id),
            language TEXT NOT NULL,
            proficiency TEXT
        );
        CREATE TABLE IF NOT EXISTS contact_emails (
            id INTEGER PRIMARY KEY,
            detail_id INTEGER NOT NULL REFERENCES job_details(id),
            email TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS contact_phones (
            id INTEGER PRIMARY KEY,
            detail_id INTEGER NOT NULL REFERENCES job_details(id),
            phone TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_resp_detail ON responsibilities(detail_id);
        CREATE INDEX IF NOT EXISTS idx_lang_detail ON job_languages(detail_id);
        ",
    );
    sql
}

// ── Value normalization ──

/// The string to store for a categorical value, if any.
fn text_value(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty() && !s.eq_ignore_ascii_case("null")).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn number_value(v: &Value) -> Option<f64> {
    let n: Option<f64> = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    };
    n.filter(|n| n.is_finite())
}

/// Items of a list-valued field; a lone scalar counts as a one-item list.
fn items(v: Option<&Value>) -> Vec<String> {
    match v {
        Some(Value::Array(xs)) => xs.iter().filter_map(text_value).collect(),
        Some(other) => text_value(other).into_iter().collect(),
        None => Vec::new(),
    }
}

fn get_or_create(conn: &Connection, table: &str, column: &str, value: &str) -> rusqlite::Result<i64> {
    conn.execute(
        &format!("INSERT OR IGNORE INTO {table} ({column}) VALUES (?1)"),
        params![value],
    )?;
    conn.query_row(
        &format!("SELECT id FROM {table} WHERE {column} = ?1"),
        params![value],
        |row| row.get(0),
    )
}

// ── Insert ──

pub fn detail_exists(conn: &Connection, posting_id: i64) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM job_details WHERE posting_id = ?1)",
        params![posting_id],
        |row| row.get(0),
    )
}

/// Store an extracted object for a posting in one transaction.
pub fn insert_detail(
    conn: &mut Connection,
    posting_id: i64,
    data: &Map<String, Value>,
) -> Result<i64, DetailError> {
    // Immediate, so the existence check and the inserts share one write lock.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if detail_exists(&tx, posting_id)? {
        return Err(DetailError::AlreadyExists(posting_id));
    }

    tx.execute(
        "INSERT INTO job_details (posting_id) VALUES (?1)",
        params![posting_id],
    )?;
    let detail_id = tx.last_insert_rowid();

    for f in LOOKUP_FIELDS {
        if let Some(value) = data.get(f.key).and_then(text_value) {
            let id = get_or_create(&tx, f.table, f.column, &value)?;
            tx.execute(
                &format!("UPDATE job_details SET {} = ?2 WHERE id = ?1", f.target),
                params![detail_id, id],
            )?;
        }
    }

    for key in NUMBER_FIELDS {
        if let Some(n) = data.get(*key).and_then(number_value) {
            tx.execute(
                &format!("UPDATE job_details SET {key} = ?2 WHERE id = ?1"),
                params![detail_id, n],
            )?;
        }
    }
    let language = data.get("original_language").and_then(text_value);
    let posting_date = data
        .get("posting_date")
        .and_then(Value::as_str)
        .and_then(|s| NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok())
        .map(|d| d.format(DATE_FORMAT).to_string());
    tx.execute(
        "UPDATE job_details SET original_language = ?2, posting_date = ?3 WHERE id = ?1",
        params![detail_id, language, posting_date],
    )?;

    for f in SET_FIELDS {
        for item in items(data.get(f.key)) {
            let id = get_or_create(&tx, f.table, f.column, &item)?;
            tx.execute(
                &format!("INSERT OR IGNORE INTO {} (detail_id, item_id) VALUES (?1, ?2)", f.link),
                params![detail_id, id],
            )?;
        }
    }

    for (pos, text) in items(data.get("responsibilities")).iter().enumerate() {
        tx.execute(
            "INSERT INTO responsibilities (detail_id, position, description) VALUES (?1, ?2, ?3)",
            params![detail_id, pos as i64, text],
        )?;
    }

    let proficiency = data.get("language_proficiency").and_then(Value::as_object);
    for lang in items(data.get("languages")) {
        let level = proficiency
            .and_then(|m| m.get(&lang))
            .and_then(text_value);
        tx.execute(
            "INSERT INTO job_languages (detail_id, language, proficiency) VALUES (?1, ?2, ?3)",
            params![detail_id, lang, level],
        )?;
    }

    for email in items(data.get("contact_emails")) {
        tx.execute(
            "INSERT INTO contact_emails (detail_id, email) VALUES (?1, ?2)",
            params![detail_id, email],
        )?;
    }
    for phone in items(data.get("contact_phones")) {
        tx.execute(
            "INSERT INTO contact_phones (detail_id, phone) VALUES (?1, ?2)",
            params![detail_id, phone],
        )?;
    }

    tx.commit()?;
    Ok(detail_id)
}

// ── Reconstruction ──

fn number_json(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn strings(conn: &Connection, sql: &str, detail_id: i64) -> rusqlite::Result<Vec<Value>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params![detail_id], |row| row.get::<_, String>(0))?
        .map(|r| r.map(Value::String))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Rebuild the extraction object stored for a posting.
pub fn load_detail(conn: &Connection, posting_id: i64) -> rusqlite::Result<Option<Map<String, Value>>> {
    let row = conn
        .query_row(
            "SELECT id, min_salary, max_salary, experience_years, original_language,
                    posting_date, processed_at
             FROM job_details WHERE posting_id = ?1",
            params![posting_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    [
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                    ],
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?;
    let Some((detail_id, numbers, language, posting_date, processed_at)) = row else {
        return Ok(None);
    };

    let mut out = Map::new();

    for f in LOOKUP_FIELDS {
        let value: Option<String> = conn
            .query_row(
                &format!(
                    "SELECT t.{col} FROM job_details d JOIN {table} t ON t.id = d.{target}
                     WHERE d.id = ?1",
                    col = f.column,
                    table = f.table,
                    target = f.target
                ),
                params![detail_id],
                |row| row.get(0),
            )
            .optional()?;
        out.insert(f.key.to_string(), value.map_or(Value::Null, Value::String));
    }

    for (key, n) in NUMBER_FIELDS.iter().zip(numbers) {
        out.insert(key.to_string(), n.map_or(Value::Null, number_json));
    }
    out.insert(
        "original_language".into(),
        language.map_or(Value::Null, Value::String),
    );
    out.insert(
        "posting_date".into(),
        posting_date.map_or(Value::Null, Value::String),
    );

    for f in SET_FIELDS {
        let values = strings(
            conn,
            &format!(
                "SELECT t.{col} FROM {link} l JOIN {table} t ON t.id = l.item_id
                 WHERE l.detail_id = ?1 ORDER BY l.rowid",
                col = f.column,
                link = f.link,
                table = f.table
            ),
            detail_id,
        )?;
        out.insert(f.key.to_string(), Value::Array(values));
    }

    out.insert(
        "responsibilities".into(),
        Value::Array(strings(
            conn,
            "SELECT description FROM responsibilities WHERE detail_id = ?1 ORDER BY position",
            detail_id,
        )?),
    );

    let mut stmt = conn.prepare(
        "SELECT language, proficiency FROM job_languages WHERE detail_id = ?1 ORDER BY id",
    )?;
    let langs = stmt
        .query_map(params![detail_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let mut proficiency = Map::new();
    for (lang, level) in &langs {
        if let Some(level) = level {
            proficiency.insert(lang.clone(), Value::String(level.clone()));
        }
    }
    out.insert(
        "languages".into(),
        Value::Array(langs.into_iter().map(|(l, _)| Value::String(l)).collect()),
    );
    out.insert("language_proficiency".into(), Value::Object(proficiency));

    out.insert(
        "contact_emails".into(),
        Value::Array(strings(
            conn,
            "SELECT email FROM contact_emails WHERE detail_id = ?1 ORDER BY id",
            detail_id,
        )?),
    );
    out.insert(
        "contact_phones".into(),
        Value::Array(strings(
            conn,
            "SELECT phone FROM contact_phones WHERE detail_id = ?1 ORDER BY id",
            detail_id,
        )?),
    );
    out.insert("processed_at".into(), Value::String(processed_at));

    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{count, date, entry, memory};
    use crate::db::upsert_listings;
    use serde_json::json;

    fn seeded() -> Connection {
        let mut conn = memory();
        upsert_listings(
            &mut conn,
            &[
                entry("s", "Acme", "Dev", "https://s/1"),
                entry("s", "Acme", "Ops", "https://s/2"),
            ],
            date("2024-05-01"),
        )
        .unwrap();
        conn
    }

    fn sample() -> Map<String, Value> {
        json!({
            "title": "  Backend Engineer ",
            "seniority_level": "Senior",
            "salary_currency": "PLN",
            "min_salary": 18000,
            "max_salary": "24,500.50",
            "experience_years": 5,
            "city": "Warsaw",
            "country": "null",
            "full_address": "ul. Prosta 1, Warsaw",
            "company_name": "Acme",
            "original_language": "pl",
            "posting_date": "2024-04-28",
            "hard_skills": ["Rust", "PostgreSQL", "Rust", ""],
            "benefits": "Private healthcare",
            "responsibilities": ["Design services", null, "Review code"],
            "languages": ["English", "Polish"],
            "language_proficiency": {"English": "C1"},
            "contact_emails": ["jobs@acme.example"],
            "contact_phones": []
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn schema_covers_every_field() {
        let conn = memory();
        for f in LOOKUP_FIELDS {
            conn.prepare(&format!("SELECT {} FROM {}", f.column, f.table)).unwrap();
            conn.prepare(&format!("SELECT {} FROM job_details", f.target)).unwrap();
        }
        for f in SET_FIELDS {
            conn.prepare(&format!("SELECT detail_id, item_id FROM {}", f.link)).unwrap();
        }
        assert_eq!(LOOKUP_FIELDS.len(), 23);
        assert_eq!(SET_FIELDS.len(), 11);
    }

    #[test]
    fn insert_and_reconstruct() {
        let mut conn = seeded();
        insert_detail(&mut conn, 1, &sample()).unwrap();

        let d = load_detail(&conn, 1).unwrap().unwrap();
        assert_eq!(d["title"], "Backend Engineer");
        assert_eq!(d["seniority_level"], "Senior");
        assert_eq!(d["salary_currency"], "PLN");
        assert_eq!(d["country"], Value::Null);
        assert_eq!(d["full_address"], "ul. Prosta 1, Warsaw");
        assert_eq!(d["min_salary"], 18000);
        assert_eq!(d["max_salary"], 24500.5);
        assert_eq!(d["experience_years"], 5);
        assert_eq!(d["posting_date"], "2024-04-28");
        assert_eq!(d["hard_skills"], json!(["Rust", "PostgreSQL"]));
        assert_eq!(d["benefits"], json!(["Private healthcare"]));
        assert_eq!(d["responsibilities"], json!(["Design services", "Review code"]));
        assert_eq!(d["languages"], json!(["English", "Polish"]));
        assert_eq!(d["language_proficiency"], json!({"English": "C1"}));
        assert_eq!(d["contact_emails"], json!(["jobs@acme.example"]));
        assert_eq!(d["contact_phones"], json!([]));
        assert_eq!(d["soft_skills"], json!([]));

        assert!(load_detail(&conn, 2).unwrap().is_none());
    }

    #[test]
    fn second_insert_is_rejected() {
        let mut conn = seeded();
        insert_detail(&mut conn, 1, &sample()).unwrap();
        let mut other = sample();
        other.insert("title".into(), json!("Changed"));
        let err = insert_detail(&mut conn, 1, &other).unwrap_err();
        assert!(matches!(err, DetailError::AlreadyExists(1)));
        assert_eq!(load_detail(&conn, 1).unwrap().unwrap()["title"], "Backend Engineer");
    }

    #[test]
    fn lookups_are_shared() {
        let mut conn = seeded();
        insert_detail(&mut conn, 1, &sample()).unwrap();
        let mut second = sample();
        second.insert("title".into(), json!("Backend Engineer"));
        insert_detail(&mut conn, 2, &second).unwrap();

        assert_eq!(count(&conn, "titles"), 1);
        assert_eq!(count(&conn, "hard_skills"), 2);
        assert_eq!(count(&conn, "detail_hard_skills"), 4);
        assert_eq!(count(&conn, "job_details"), 2);
    }

    #[test]
    fn failed_insert_leaves_nothing() {
        let mut conn = seeded();
        // No such posting: the foreign key fails and the transaction rolls back.
        assert!(insert_detail(&mut conn, 99, &sample()).is_err());
        assert_eq!(count(&conn, "job_details"), 0);
        assert_eq!(count(&conn, "titles"), 0);
    }

    #[test]
    fn value_normalization() {
        assert_eq!(text_value(&json!(" x ")), Some("x".into()));
        assert_eq!(text_value(&json!("NULL")), None);
        assert_eq!(text_value(&json!(3)), Some("3".into()));
        assert_eq!(text_value(&json!(true)), Some("true".into()));
        assert_eq!(text_value(&json!(["a"])), None);
        assert_eq!(number_value(&json!("abc")), None);
        assert_eq!(number_value(&json!(" 12 ")), Some(12.0));
    }

    #[test]
    fn insert_waits_for_another_worker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.sqlite");
        let mut conn = crate::db::connect(&path).unwrap();
        crate::db::init_schema(&conn).unwrap();
        upsert_listings(
            &mut conn,
            &[entry("s", "Acme", "Dev", "https://s/1")],
            date("2024-05-01"),
        )
        .unwrap();

        let other = crate::db::connect(&path).unwrap();
        other.execute_batch("BEGIN IMMEDIATE").unwrap();
        crate::db::save_site_bound(&other, "s", 2).unwrap();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(200));
            other.execute_batch("COMMIT").unwrap();
        });

        let id = insert_detail(&mut conn, 1, &sample());
        worker.join().unwrap();

        assert!(id.is_ok());
        assert_eq!(load_detail(&conn, 1).unwrap().unwrap()["title"], "Backend Engineer");
    }

    #[test]
    fn bad_posting_date_is_dropped() {
        let mut conn = seeded();
        let mut data = sample();
        data.insert("posting_date".into(), json!("last week"));
        insert_detail(&mut conn, 1, &data).unwrap();
        assert_eq!(load_detail(&conn, 1).unwrap().unwrap()["posting_date"], Value::Null);
    }
}
