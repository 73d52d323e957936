//! Server-rendered HTML pages.
//!
//! Pages are plain `format!` templates with one shared stylesheet. All user
//! content passes through [`escape`]; item bodies are shown as preformatted
//! text.

use chrono::{DateTime, Utc};
use std::fmt::Write;

use crate::database::{QueryOutcome, TableInfo};
use crate::listset::ResolvedMember;
use crate::models::{Item, ItemKind, ItemRef};
use crate::plot::PlotKind;
use crate::search::SearchHit;

const STYLE: &str = r#"
*,*::before,*::after{box-sizing:border-box}
body{margin:0;font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',Roboto,sans-serif;background:#fafaf9;color:#1c1917;line-height:1.45}
nav{background:#1c1917;padding:10px 24px;display:flex;gap:16px;flex-wrap:wrap;align-items:center}
nav a{color:#e7e5e4;text-decoration:none;font-size:.9rem}
nav a.brand{font-weight:700;color:#2dd4bf}
nav form{margin-left:auto}
main{max-width:960px;margin:0 auto;padding:24px}
h1{font-size:1.5rem;margin:0 0 16px}
h2{font-size:1.1rem;margin:24px 0 8px}
a{color:#0f766e}
pre{background:#fff;border:1px solid #e7e5e4;border-radius:8px;padding:12px;white-space:pre-wrap;word-break:break-word}
table{border-collapse:collapse;width:100%;background:#fff;font-size:.875rem}
th,td{border:1px solid #e7e5e4;padding:4px 8px;text-align:left;vertical-align:top}
th{background:#f5f5f4}
ul.items{list-style:none;padding:0;margin:0}
ul.items li{padding:8px 0;border-bottom:1px solid #e7e5e4}
.meta{color:#78716c;font-size:.8rem}
.kw{display:inline-block;background:#ccfbf1;color:#134e4a;border-radius:999px;padding:0 8px;margin:0 4px 4px 0;font-size:.8rem;text-decoration:none}
.actions{display:flex;gap:8px;flex-wrap:wrap;margin:12px 0}
.actions form{display:inline}
label{display:block;margin:12px 0 4px;font-weight:600;font-size:.9rem}
input[type=text],input[type=url],input[type=search],textarea,select{width:100%;padding:6px 8px;border:1px solid #d6d3d1;border-radius:6px;font:inherit}
textarea{min-height:160px;font-family:ui-monospace,monospace}
button{padding:6px 14px;border:none;border-radius:6px;background:#0f766e;color:#fff;cursor:pointer;font:inherit}
button.danger{background:#b91c1c}
button.plain{background:#e7e5e4;color:#1c1917;padding:2px 8px}
.error{background:#fef2f2;border:1px solid #fecaca;border-radius:8px;padding:12px;color:#991b1b}
.grid{display:grid;grid-template-columns:repeat(auto-fill,minmax(140px,1fr));gap:12px}
.card{background:#fff;border:1px solid #e7e5e4;border-radius:8px;padding:12px}
.card .n{font-size:1.6rem;font-weight:700}
img.preview{max-width:100%;border:1px solid #e7e5e4;border-radius:8px}
"#;

/// Escapes text for use in HTML or XML content and attribute values.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Percent-encodes one URL path segment.
pub fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for b in segment.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{:02X}", b);
        }
    }
    out
}

fn layout(title: &str, content: &str) -> String {
    let mut nav = String::new();
    for kind in ItemKind::ALL {
        let _ = write!(
            nav,
            r#"<a href="/{plural}">{label}</a>"#,
            plural = kind.plural(),
            label = capitalize(kind.plural())
        );
    }
    format!(
        r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title} · chaos</title>
<style>{style}</style>
</head>
<body>
<nav><a class="brand" href="/">chaos</a>{nav}<a href="/keywords">Keywords</a>
<form action="/search" method="get"><input type="search" name="q" placeholder="Search"></form></nav>
<main>
{content}
</main>
</body>
</html>"##,
        title = escape(title),
        style = STYLE,
        nav = nav,
        content = content
    )
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn fmt_time(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn item_href(item_ref: &ItemRef) -> String {
    format!("/{}/{}", item_ref.kind.plural(), item_ref.id)
}

fn item_link(item: &Item) -> String {
    format!(
        r#"<a href="{}">{}</a>"#,
        item_href(&item.item_ref()),
        escape(item.display_title())
    )
}

fn keyword_chips<'a>(keywords: impl IntoIterator<Item = &'a String>) -> String {
    keywords
        .into_iter()
        .map(|k| {
            format!(
                r#"<a class="kw" href="/keywords/{}">{}</a>"#,
                encode_segment(k),
                escape(k)
            )
        })
        .collect()
}

fn item_rows(items: &[Item]) -> String {
    if items.is_empty() {
        return "<p class=\"meta\">Nothing here yet.</p>".to_string();
    }
    let mut out = String::from("<ul class=\"items\">");
    for item in items {
        let _ = write!(
            out,
            r#"<li>{link} <span class="meta">{kind} · updated {updated}</span><br>{chips}</li>"#,
            link = item_link(item),
            kind = item.kind.label(),
            updated = fmt_time(item.meta.updated),
            chips = keyword_chips(&item.meta.keywords)
        );
    }
    out.push_str("</ul>");
    out
}

pub fn dashboard(
    counts: &[(ItemKind, usize)],
    recent: &[Item],
    keywords: &[(String, usize)],
) -> String {
    let mut cards = String::from("<div class=\"grid\">");
    for (kind, n) in counts {
        let _ = write!(
            cards,
            r#"<a class="card" href="/{plural}"><div class="n">{n}</div>{plural}</a>"#,
            plural = kind.plural(),
            n = n
        );
    }
    cards.push_str("</div>");

    let kw: String = keywords
        .iter()
        .map(|(k, n)| {
            format!(
                r#"<a class="kw" href="/keywords/{}">{} ({})</a>"#,
                encode_segment(k),
                escape(k),
                n
            )
        })
        .collect();

    let content = format!(
        "<h1>Dashboard</h1>{cards}<h2>Recently updated</h2>{recent}<h2>Top keywords</h2><p>{kw}</p>",
        cards = cards,
        recent = item_rows(recent),
        kw = if kw.is_empty() { "<span class=\"meta\">No keywords yet.</span>".to_string() } else { kw }
    );
    layout("Dashboard", &content)
}

pub fn item_list(kind: ItemKind, items: &[Item]) -> String {
    let content = format!(
        r#"<h1>{title}</h1><div class="actions"><a href="/{plural}/new">New {label}</a></div>{rows}"#,
        title = capitalize(kind.plural()),
        plural = kind.plural(),
        label = kind.label(),
        rows = item_rows(items)
    );
    layout(&capitalize(kind.plural()), &content)
}

/// Query state shown on a database item page.
#[derive(Debug, Default)]
pub struct DatabaseView {
    pub tables: Vec<TableInfo>,
    pub sql: String,
    pub outcome: Option<QueryOutcome>,
    pub error: Option<String>,
    pub has_plot: bool,
}

/// Everything the item page shows besides the item itself.
#[derive(Debug, Default)]
pub struct ItemPage {
    pub related: Vec<(Item, usize)>,
    pub containing: Vec<Item>,
    pub members: Vec<ResolvedMember>,
    pub database: Option<DatabaseView>,
}

pub fn item_page(item: &Item, page: &ItemPage) -> String {
    let item_ref = item.item_ref();
    let href = item_href(&item_ref);
    let mut content = String::new();

    let _ = write!(
        content,
        r#"<h1>{title}</h1><p class="meta">{kind} · created {created} · updated {updated}</p><p>{chips}</p>"#,
        title = escape(item.display_title()),
        kind = item.kind.label(),
        created = fmt_time(item.meta.created),
        updated = fmt_time(item.meta.updated),
        chips = keyword_chips(&item.meta.keywords)
    );
    let _ = write!(
        content,
        r#"<div class="actions"><a href="{href}/edit">Edit</a><form method="post" action="{href}/delete" onsubmit="return confirm('Delete this item?')"><button class="danger">Delete</button></form></div>"#,
        href = href
    );

    match item.kind {
        ItemKind::Link => {
            if let Some(url) = &item.meta.url {
                let _ = write!(
                    content,
                    r#"<p><a href="{u}" rel="noopener noreferrer">{u}</a></p>"#,
                    u = escape(url)
                );
            }
        }
        ItemKind::Image => {
            let _ = write!(
                content,
                r#"<p><img class="preview" src="{href}/attachment" alt="{alt}"></p>"#,
                href = href,
                alt = escape(item.display_title())
            );
        }
        ItemKind::File => {
            let _ = write!(
                content,
                r#"<p><a href="{href}/attachment">Download {name}</a> <span class="meta">{ctype} · {size} bytes</span></p>"#,
                href = href,
                name = escape(item.meta.filename.as_deref().unwrap_or("file")),
                ctype = escape(item.meta.content_type.as_deref().unwrap_or("")),
                size = item.meta.size.unwrap_or(0)
            );
        }
        _ => {}
    }

    if !item.body.trim().is_empty() {
        let _ = write!(content, "<pre>{}</pre>", escape(&item.body));
    }

    if let Some(db) = &page.database {
        content.push_str(&database_section(&href, db));
    }
    if item.kind == ItemKind::Listset {
        content.push_str(&members_section(&href, &page.members));
    }

    if !page.related.is_empty() {
        content.push_str("<h2>Related</h2><ul class=\"items\">");
        for (other, shared) in &page.related {
            let _ = write!(
                content,
                r#"<li>{link} <span class="meta">{kind} · {shared} shared keyword{s}</span></li>"#,
                link = item_link(other),
                kind = other.kind.label(),
                shared = shared,
                s = if *shared == 1 { "" } else { "s" }
            );
        }
        content.push_str("</ul>");
    }

    if !page.containing.is_empty() {
        content.push_str("<h2>In listsets</h2><ul class=\"items\">");
        for set in &page.containing {
            let _ = write!(content, "<li>{}</li>", item_link(set));
        }
        content.push_str("</ul>");
    }

    layout(item.display_title(), &content)
}

fn database_section(href: &str, db: &DatabaseView) -> String {
    let mut out = String::from("<h2>Tables</h2>");
    if db.tables.is_empty() {
        out.push_str("<p class=\"meta\">No tables yet. Import a CSV or run CREATE TABLE.</p>");
    } else {
        out.push_str("<ul>");
        for table in &db.tables {
            let _ = write!(
                out,
                "<li><strong>{}</strong> <span class=\"meta\">{}</span></li>",
                escape(&table.name),
                escape(&table.columns.join(", "))
            );
        }
        out.push_str("</ul>");
    }

    let _ = write!(
        out,
        r#"<h2>Query</h2><form method="post" action="{href}/query">
<textarea name="sql">{sql}</textarea>
<label><input type="checkbox" name="save" value="1"> Save as default query</label>
<button>Run</button></form>"#,
        href = href,
        sql = escape(&db.sql)
    );

    if let Some(error) = &db.error {
        let _ = write!(out, r#"<p class="error">{}</p>"#, escape(error));
    }
    if let Some(outcome) = &db.outcome {
        out.push_str(&results_table(outcome));
    }
    if db.has_plot {
        let _ = write!(
            out,
            r#"<h2>Plot</h2><p><img class="preview" src="{href}/plot.svg" alt="plot"></p>"#,
            href = href
        );
    }

    let _ = write!(
        out,
        r#"<h2>Import CSV</h2><form method="post" action="{href}/import" enctype="multipart/form-data">
<label>Table</label><input type="text" name="table" required>
<label>CSV file</label><input type="file" name="csv" accept=".csv,text/csv">
<label>or paste CSV</label><textarea name="csv_text"></textarea>
<button>Import</button></form>"#,
        href = href
    );
    out
}

fn results_table(outcome: &QueryOutcome) -> String {
    if let Some(n) = outcome.rows_affected {
        return format!("<p class=\"meta\">{} rows affected.</p>", n);
    }
    let mut out = String::from("<table><tr>");
    for col in &outcome.columns {
        let _ = write!(out, "<th>{}</th>", escape(col));
    }
    out.push_str("</tr>");
    for row in &outcome.rows {
        out.push_str("<tr>");
        for cell in row {
            let _ = write!(out, "<td>{}</td>", escape(&cell.to_string()));
        }
        out.push_str("</tr>");
    }
    out.push_str("</table>");
    let _ = write!(
        out,
        "<p class=\"meta\">{} rows{}</p>",
        outcome.rows.len(),
        if outcome.truncated { " (truncated)" } else { "" }
    );
    out
}

fn members_section(href: &str, members: &[ResolvedMember]) -> String {
    let mut out = String::from("<h2>Members</h2>");
    if members.is_empty() {
        out.push_str("<p class=\"meta\">No members yet.</p>");
    } else {
        out.push_str("<table>");
        for member in members {
            let label = match &member.item {
                Some(item) => format!(
                    "{} <span class=\"meta\">{}</span>",
                    item_link(item),
                    item.kind.label()
                ),
                None => format!(
                    "<span class=\"meta\">{} (missing)</span>",
                    escape(&member.item_ref.to_string())
                ),
            };
            let mut buttons = String::new();
            for (action, text) in [("up", "↑"), ("down", "↓"), ("remove", "Remove")] {
                let _ = write!(
                    buttons,
                    r#"<form method="post" action="{href}/members/{pos}/{action}"><button class="plain">{text}</button></form>"#,
                    href = href,
                    pos = member.position,
                    action = action,
                    text = text
                );
            }
            let _ = write!(
                out,
                r#"<tr><td>{n}</td><td>{label}</td><td><div class="actions">{buttons}</div></td></tr>"#,
                n = member.position + 1,
                label = label,
                buttons = buttons
            );
        }
        out.push_str("</table>");
    }
    let _ = write!(
        out,
        r#"<form method="post" action="{href}/members"><label>Add member (e.g. notes/&lt;id&gt;)</label><input type="text" name="member" required> <button>Add</button></form>"#,
        href = href
    );
    out
}

/// New-item form when `existing` is `None`, edit form otherwise.
pub fn item_form(kind: ItemKind, existing: Option<&Item>) -> String {
    let (action, heading) = match existing {
        Some(item) => (
            item_href(&item.item_ref()),
            format!("Edit {}", item.display_title()),
        ),
        None => (format!("/{}", kind.plural()), format!("New {}", kind.label())),
    };
    let meta = existing.map(|i| &i.meta);
    let title = meta.map(|m| m.title.as_str()).unwrap_or("");
    let keywords = meta
        .map(|m| m.keywords.iter().cloned().collect::<Vec<_>>().join(", "))
        .unwrap_or_default();
    let body = existing.map(|i| i.body.as_str()).unwrap_or("");

    let mut fields = String::new();
    let _ = write!(
        fields,
        r#"<label>Title</label><input type="text" name="title" value="{title}">
<label>Keywords (comma separated)</label><input type="text" name="keywords" value="{keywords}">"#,
        title = escape(title),
        keywords = escape(&keywords)
    );

    match kind {
        ItemKind::Link => {
            let url = meta.and_then(|m| m.url.as_deref()).unwrap_or("");
            let _ = write!(
                fields,
                r#"<label>URL</label><input type="url" name="url" value="{}" required>"#,
                escape(url)
            );
        }
        ItemKind::Image | ItemKind::File => {
            let required = if existing.is_none() { " required" } else { "" };
            let accept = if kind == ItemKind::Image {
                r#" accept="image/*""#
            } else {
                ""
            };
            let _ = write!(
                fields,
                r#"<label>File{hint}</label><input type="file" name="attachment"{accept}{required}>"#,
                hint = if existing.is_some() { " (leave empty to keep)" } else { "" },
                accept = accept,
                required = required
            );
        }
        ItemKind::Database => {
            let query = meta.and_then(|m| m.query.as_deref()).unwrap_or("");
            let plot = meta.and_then(|m| m.plot.as_ref());
            let plot_kind = plot.map(|p| p.kind);
            let mut options = String::from(r#"<option value="">none</option>"#);
            for k in [PlotKind::Line, PlotKind::Bar, PlotKind::Scatter] {
                let _ = write!(
                    options,
                    r#"<option value="{v}"{sel}>{v}</option>"#,
                    v = k.as_str(),
                    sel = if plot_kind == Some(k) { " selected" } else { "" }
                );
            }
            let _ = write!(
                fields,
                r#"<label>SQLite file (optional, replaces the database)</label><input type="file" name="attachment">
<label>Default query</label><textarea name="query">{query}</textarea>
<label>Plot</label><select name="plot_kind">{options}</select>
<label>Plot x column</label><input type="text" name="plot_x" value="{x}">
<label>Plot y columns (comma separated)</label><input type="text" name="plot_y" value="{y}">
<label>Plot title</label><input type="text" name="plot_title" value="{ptitle}">"#,
                query = escape(query),
                options = options,
                x = escape(plot.map(|p| p.x.as_str()).unwrap_or("")),
                y = escape(&plot.map(|p| p.y.join(", ")).unwrap_or_default()),
                ptitle = escape(plot.and_then(|p| p.title.as_deref()).unwrap_or(""))
            );
        }
        ItemKind::Listset => {
            let members = meta
                .map(|m| {
                    m.members
                        .iter()
                        .map(|r| r.to_string())
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            let _ = write!(
                fields,
                r#"<label>Members (one ref per line, e.g. notes/&lt;id&gt;)</label><textarea name="members">{}</textarea>"#,
                escape(&members)
            );
        }
        ItemKind::Note => {}
    }

    let _ = write!(
        fields,
        r#"<label>Body</label><textarea name="body">{}</textarea>"#,
        escape(body)
    );

    let content = format!(
        r#"<h1>{heading}</h1><form method="post" action="{action}" enctype="multipart/form-data">{fields}<p><button>Save</button></p></form>"#,
        heading = escape(&heading),
        action = action,
        fields = fields
    );
    layout(&heading, &content)
}

pub fn search_page(query: &str, kind: Option<ItemKind>, hits: &[SearchHit]) -> String {
    let mut options = String::from(r#"<option value="">all kinds</option>"#);
    for k in ItemKind::ALL {
        let _ = write!(
            options,
            r#"<option value="{v}"{sel}>{v}</option>"#,
            v = k.plural(),
            sel = if kind == Some(k) { " selected" } else { "" }
        );
    }
    let mut content = format!(
        r#"<h1>Search</h1><form method="get" action="/search"><input type="search" name="q" value="{q}"> <select name="kind" style="width:auto">{options}</select> <button>Search</button></form>"#,
        q = escape(query),
        options = options
    );

    if !query.trim().is_empty() {
        if hits.is_empty() {
            content.push_str("<p class=\"meta\">No results.</p>");
        } else {
            content.push_str("<ul class=\"items\">");
            for hit in hits {
                let title = if hit.title.trim().is_empty() {
                    hit.item.id.as_str()
                } else {
                    hit.title.as_str()
                };
                let _ = write!(
                    content,
                    r#"<li><a href="{href}">{title}</a> <span class="meta">{kind} · score {score:.2}</span><br><span class="meta">{snippet}</span></li>"#,
                    href = item_href(&hit.item),
                    title = escape(title),
                    kind = hit.item.kind.label(),
                    score = hit.score,
                    snippet = escape(&hit.snippet)
                );
            }
            content.push_str("</ul>");
        }
    }
    layout("Search", &content)
}

pub fn keywords_page(counts: &[(String, usize)]) -> String {
    let mut content = String::from("<h1>Keywords</h1>");
    if counts.is_empty() {
        content.push_str("<p class=\"meta\">No keywords yet.</p>");
    } else {
        content.push_str("<p>");
        for (keyword, n) in counts {
            let _ = write!(
                content,
                r#"<a class="kw" href="/keywords/{}">{} ({})</a>"#,
                encode_segment(keyword),
                escape(keyword),
                n
            );
        }
        content.push_str("</p>");
    }
    layout("Keywords", &content)
}

pub fn keyword_page(keyword: &str, items: &[Item]) -> String {
    let content = format!(
        "<h1>Keyword: {}</h1>{}",
        escape(keyword),
        item_rows(items)
    );
    layout(keyword, &content)
}

pub fn error_page(status: u16, message: &str) -> String {
    let content = format!(
        r#"<h1>Error {status}</h1><p class="error">{message}</p><p><a href="/">Back to the dashboard</a></p>"#,
        status = status,
        message = escape(message)
    );
    layout(&format!("Error {}", status), &content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Frontmatter;

    fn item(kind: ItemKind, title: &str) -> Item {
        Item {
            kind,
            id: "abc".to_string(),
            meta: Frontmatter {
                title: title.to_string(),
                keywords: ["web dev".to_string()].into_iter().collect(),
                ..Default::default()
            },
            body: "<script>alert(1)</script>".to_string(),
        }
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(
            escape(r#"<a href="x">Tom & 'Jerry'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;Tom &amp; &#39;Jerry&#39;&lt;/a&gt;"
        );
    }

    #[test]
    fn encodes_path_segments() {
        assert_eq!(encode_segment("machine learning"), "machine%20learning");
        assert_eq!(encode_segment("c++/é"), "c%2B%2B%2F%C3%A9");
        assert_eq!(encode_segment("rust-lang_2.0"), "rust-lang_2.0");
    }

    #[test]
    fn item_page_escapes_body_and_links_keywords() {
        let page = item_page(&item(ItemKind::Note, "A <b>note</b>"), &ItemPage::default());
        assert!(page.contains("&lt;script&gt;"));
        assert!(!page.contains("<script>"));
        assert!(page.contains("A &lt;b&gt;note&lt;/b&gt;"));
        assert!(page.contains(r#"href="/keywords/web%20dev""#));
        assert!(page.contains(r#"action="/notes/abc/delete""#));
    }

    #[test]
    fn forms_post_to_the_right_place() {
        let new_link = item_form(ItemKind::Link, None);
        assert!(new_link.contains(r#"action="/links""#));
        assert!(new_link.contains(r#"name="url""#));

        let edit = item_form(ItemKind::Database, Some(&item(ItemKind::Database, "Sales")));
        assert!(edit.contains(r#"action="/databases/abc""#));
        assert!(edit.contains(r#"name="plot_kind""#));
        assert!(edit.contains("web dev"));
    }
}
