//! Directory-listing page parsing
//!
//! Handles the two common autoindex layouts:
//!
//! - Apache style: a `<table>` whose header row names a `Name` and a `Size` column
//! - nginx style: a `<pre>` block of anchors, each followed by a date and a size

use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::IndexError;
use optmirror_common::units::parse_size;

/// One row of a listing page, already classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingRow {
    Folder(Url),
    File { url: Url, size: u64 },
}

/// Make sure a folder URL ends in `/` so that relative names join beneath it
pub fn as_folder(url: &Url) -> Url {
    let mut folder = url.clone();
    if !folder.path().ends_with('/') {
        let path = format!("{}/", folder.path());
        folder.set_path(&path);
    }
    folder.set_query(None);
    folder.set_fragment(None);
    folder
}

fn selector(css: &str) -> Result<Selector, IndexError> {
    Selector::parse(css).map_err(|e| IndexError::Parse {
        url: String::new(),
        reason: format!("bad selector '{css}': {e:?}"),
    })
}

fn cell_text(cell: &ElementRef<'_>) -> String {
    cell.text().collect::<String>().trim().to_string()
}

/// Parse a listing page fetched from `page_url`
pub fn parse_listing(html: &str, page_url: &Url) -> Result<Vec<ListingRow>, IndexError> {
    let page = as_folder(page_url);
    let document = Html::parse_document(html);

    let table = selector("table")?;
    if let Some(table) = document.select(&table).next() {
        return parse_table(table, &page);
    }

    let pre = selector("pre")?;
    if let Some(pre) = document.select(&pre).next() {
        return parse_pre(pre, &page);
    }

    Err(IndexError::Parse {
        url: page.to_string(),
        reason: "no listing table found".to_string(),
    })
}

fn parse_table(table: ElementRef<'_>, page: &Url) -> Result<Vec<ListingRow>, IndexError> {
    let tr = selector("tr")?;
    let th = selector("th")?;
    let td = selector("td")?;
    let anchor = selector("a")?;

    let mut columns: Option<(usize, usize)> = None;
    let mut rows = Vec::new();

    for row in table.select(&tr) {
        let headers: Vec<String> = row.select(&th).map(|h| cell_text(&h)).collect();
        if !headers.is_empty() {
            if columns.is_none() {
                let find = |wanted: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(wanted));
                if let Some(name_idx) = find("name") {
                    let size_idx = find("size").ok_or_else(|| IndexError::Parse {
                        url: page.to_string(),
                        reason: "listing table has no Size column".to_string(),
                    })?;
                    columns = Some((name_idx, size_idx));
                }
            }
            continue;
        }

        let Some((name_idx, size_idx)) = columns else {
            continue;
        };
        let cells: Vec<ElementRef<'_>> = row.select(&td).collect();
        let Some(name_cell) = cells.get(name_idx) else {
            continue;
        };

        // The link target is never truncated, unlike the displayed name.
        let target = name_cell
            .select(&anchor)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::to_string)
            .unwrap_or_else(|| cell_text(name_cell));
        let size = cells.get(size_idx).map(cell_text).unwrap_or_default();

        if let Some(row) = classify(page, &target, &size)? {
            rows.push(row);
        }
    }

    if columns.is_none() {
        return Err(IndexError::Parse {
            url: page.to_string(),
            reason: "listing table has no Name column".to_string(),
        });
    }

    Ok(rows)
}

fn parse_pre(pre: ElementRef<'_>, page: &Url) -> Result<Vec<ListingRow>, IndexError> {
    let anchor = selector("a")?;
    let mut rows = Vec::new();

    for a in pre.select(&anchor) {
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        let size = a
            .next_sibling()
            .and_then(|node| node.value().as_text())
            .and_then(|text| text.split_whitespace().last().map(str::to_string))
            .unwrap_or_default();

        if let Some(row) = classify(page, href, &size)? {
            rows.push(row);
        }
    }

    Ok(rows)
}

/// Resolve a row's link and decide whether it is a folder or a file.
///
/// Returns `None` for rows that are not children of the page: the parent directory link,
/// column sort links and absolute links elsewhere.
fn classify(page: &Url, target: &str, size: &str) -> Result<Option<ListingRow>, IndexError> {
    let target = target.trim();
    if target.is_empty() || target.starts_with('?') || target.starts_with('#') {
        return Ok(None);
    }

    let url = page.join(target)?;
    if url.as_str().len() <= page.as_str().len() || !url.as_str().starts_with(page.as_str()) {
        return Ok(None);
    }

    if url.path().ends_with('/') {
        return Ok(Some(ListingRow::Folder(url)));
    }

    let size = parse_size(size).map_err(|source| IndexError::Size {
        url: url.to_string(),
        source,
    })?;
    Ok(Some(ListingRow::File { url, size }))
}
