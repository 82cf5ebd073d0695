//! HTTPS client for gallica.bnf.fr and the BnF catalog.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use autobib_pdf::UnscaledPageBounds;
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::AsyncWriteExt;

use super::{
    Archive, ArchiveError, ArchiveFuture, Ark, OaiRecord, ProbeFuture, ProbeOutcome, RawHit,
    SearchPage,
};
use crate::RetrievalSettings;
use crate::issue::PageMap;
use crate::rate_limit::{RateLimiters, check_rate_limit_response, host_of};
use crate::xml;

pub const USER_AGENT: &str = concat!("autobib/", env!("CARGO_PKG_VERSION"));

pub struct Gallica {
    client: reqwest::Client,
    limiters: Arc<RateLimiters>,
    settings: RetrievalSettings,
}

/// HTTP client configured for the archive: fixed user agent, no redirects.
pub fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

impl Gallica {
    pub fn new(client: reqwest::Client, limiters: Arc<RateLimiters>, settings: RetrievalSettings) -> Self {
        Self {
            client,
            limiters,
            settings,
        }
    }

    fn base(&self) -> &str {
        self.settings.base_url.trim_end_matches('/')
    }

    pub fn search_url(&self, query: &str, start: usize, count: usize) -> String {
        format!(
            "{}?version=1.2&operation=searchRetrieve&recordSchema=dublincore&query={}&startRecord={}&maximumRecords={}",
            self.settings.catalog_url,
            urlencoding::encode(query),
            start,
            count
        )
    }

    pub fn issues_url(&self, series: &Ark, year: i64) -> String {
        format!("{}/services/Issues?ark={series}/date&date={year}", self.base())
    }

    pub fn oai_url(&self, issue: &Ark) -> String {
        format!("{}/services/OAIRecord?ark={issue}", self.base())
    }

    pub fn pagination_url(&self, issue: &Ark) -> String {
        format!("{}/services/Pagination?ark={}", self.base(), issue.name())
    }

    pub fn toc_url(&self, issue: &Ark) -> String {
        format!("{}/services/Toc?ark={issue}", self.base())
    }

    pub fn text_url(&self, issue: &Ark, page: u32) -> String {
        format!("{}/{issue}/f{page}.texteBrut", self.base())
    }

    pub fn alto_url(&self, issue: &Ark, page: u32) -> String {
        format!(
            "{}/RequestDigitalElement?O={}&E=ALTO&Deb={page}",
            self.base(),
            issue.name()
        )
    }

    pub fn chunk_url(&self, issue: &Ark, start: u32, count: u32) -> String {
        format!("{}/{issue}/f{start}n{count}.pdf?download=1", self.base())
    }

    pub fn image_url(&self, issue: &Ark, page: u32) -> String {
        format!("{}/iiif/{issue}/f{page}/full/full/0/native.jpg", self.base())
    }

    /// Rate-limited GET that maps 429 and non-success statuses to errors.
    async fn get(&self, url: &str, timeout: Duration) -> Result<reqwest::Response, ArchiveError> {
        let host = host_of(url);
        self.limiters.acquire(host).await;
        tracing::debug!(url, "GET");
        let resp = self.client.get(url).timeout(timeout).send().await?;
        if let Err(e) = check_rate_limit_response(&resp) {
            self.limiters.on_rate_limited(host);
            return Err(e);
        }
        if !resp.status().is_success() {
            return Err(ArchiveError::Status {
                status: resp.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(resp)
    }

    async fn get_text(&self, url: &str) -> Result<String, ArchiveError> {
        let body = self.get(url, self.settings.timeout).await?.text().await?;
        if body.trim().is_empty() {
            return Err(ArchiveError::Empty(url.to_string()));
        }
        Ok(body)
    }

    async fn probe(&self, url: String, head: bool) -> ProbeOutcome {
        let host = host_of(&url);
        self.limiters.acquire(host).await;
        let request = if head {
            self.client.head(&url)
        } else {
            self.client.get(&url)
        };
        match request.timeout(self.settings.timeout).send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    ProbeOutcome::Available
                } else if status.is_redirection() || status.as_u16() == 403 {
                    tracing::debug!(url, status = status.as_u16(), "delivery blocked");
                    ProbeOutcome::Blocked
                } else {
                    if status.as_u16() == 429 {
                        self.limiters.on_rate_limited(host);
                    }
                    ProbeOutcome::Failed(format!("HTTP {status}"))
                }
            }
            Err(e) => ProbeOutcome::Failed(e.to_string()),
        }
    }
}

impl Archive for Gallica {
    fn search<'a>(&'a self, query: &'a str, start: usize, count: usize) -> ArchiveFuture<'a, SearchPage> {
        Box::pin(async move {
            let body = self.get_text(&self.search_url(query, start, count)).await?;
            parse_sru(&body)
        })
    }

    fn issues<'a>(&'a self, series: &'a Ark, year: i64) -> ArchiveFuture<'a, Vec<Ark>> {
        Box::pin(async move {
            let body = self.get_text(&self.issues_url(series, year)).await?;
            parse_issues(&body, series)
        })
    }

    fn oai_record<'a>(&'a self, issue: &'a Ark) -> ArchiveFuture<'a, OaiRecord> {
        Box::pin(async move {
            let body = self.get_text(&self.oai_url(issue)).await?;
            parse_oai(&body)
        })
    }

    fn pagination<'a>(&'a self, issue: &'a Ark) -> ArchiveFuture<'a, PageMap> {
        Box::pin(async move {
            let body = self.get_text(&self.pagination_url(issue)).await?;
            parse_pagination(&body)
        })
    }

    fn toc<'a>(&'a self, issue: &'a Ark) -> ArchiveFuture<'a, Option<String>> {
        Box::pin(async move {
            let body = match self.get_text(&self.toc_url(issue)).await {
                Ok(body) => body,
                Err(ArchiveError::Empty(_)) => return Ok(None),
                Err(e) => return Err(e),
            };
            Ok(toc_markup(body))
        })
    }

    fn page_text<'a>(&'a self, issue: &'a Ark, page: u32) -> ArchiveFuture<'a, String> {
        Box::pin(async move {
            let body = self.get_text(&self.text_url(issue, page)).await?;
            Ok(strip_markup(&body))
        })
    }

    fn ocr_bounds<'a>(&'a self, issue: &'a Ark, page: u32) -> ArchiveFuture<'a, UnscaledPageBounds> {
        Box::pin(async move {
            let body = self.get_text(&self.alto_url(issue, page)).await?;
            parse_alto(&body)
        })
    }

    fn delivery_probe<'a>(&'a self, issue: &'a Ark) -> ProbeFuture<'a> {
        Box::pin(self.probe(self.chunk_url(issue, 1, 1), true))
    }

    fn page_probe<'a>(&'a self, issue: &'a Ark, page: u32) -> ProbeFuture<'a> {
        Box::pin(self.probe(self.text_url(issue, page), false))
    }

    fn fetch_pdf<'a>(
        &'a self,
        issue: &'a Ark,
        start: u32,
        count: u32,
        dest: &'a Path,
    ) -> ArchiveFuture<'a, ()> {
        Box::pin(async move {
            let url = self.chunk_url(issue, start, count);
            let resp = self.get(&url, self.settings.download_timeout).await?;
            let mut file = tokio::fs::File::create(dest).await?;
            let mut stream = resp.bytes_stream();
            let mut written = 0usize;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                written += chunk.len();
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            if written == 0 {
                return Err(ArchiveError::Empty(url));
            }
            tracing::debug!(ark = %issue, start, count, bytes = written, "chunk written");
            Ok(())
        })
    }

    fn fetch_page_image<'a>(&'a self, issue: &'a Ark, page: u32) -> ArchiveFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let url = self.image_url(issue, page);
            let bytes = self.get(&url, self.settings.download_timeout).await?.bytes().await?;
            if bytes.is_empty() {
                return Err(ArchiveError::Empty(url));
            }
            Ok(bytes.to_vec())
        })
    }
}

fn parse_doc(body: &str) -> Result<xml::Element, ArchiveError> {
    Ok(xml::parse(body)?)
}

/// SRU `searchRetrieve` response with Dublin Core records.
pub fn parse_sru(body: &str) -> Result<SearchPage, ArchiveError> {
    let doc = parse_doc(body)?;
    let total = match doc.find("numberOfRecords") {
        Some(el) => el
            .text()
            .trim()
            .parse()
            .map_err(|_| ArchiveError::Malformed(format!("numberOfRecords {:?}", el.text())))?,
        None => return Err(ArchiveError::Malformed("no numberOfRecords in SRU response".into())),
    };
    let hits = doc
        .find_all("record")
        .into_iter()
        .filter_map(|record| record.find("dc"))
        .map(|dc| {
            let mut hit = RawHit::default();
            for field in dc.child_elements() {
                let value = field.text().trim().to_string();
                if !value.is_empty() {
                    hit.push(field.name.clone(), value);
                }
            }
            hit
        })
        .collect();
    Ok(SearchPage { total, hits })
}

/// `services/Issues`: one `<issue ark="...">` per issue in the year.
pub fn parse_issues(body: &str, series: &Ark) -> Result<Vec<Ark>, ArchiveError> {
    let doc = parse_doc(body)?;
    Ok(doc
        .find_all("issue")
        .into_iter()
        .filter_map(|issue| issue.attr("ark"))
        .map(|id| Ark::parse(id).unwrap_or_else(|_| Ark::new(series.naan(), id.trim())))
        .collect())
}

pub fn parse_oai(body: &str) -> Result<OaiRecord, ArchiveError> {
    let doc = parse_doc(body)?;
    let dc = doc
        .find("dc")
        .ok_or_else(|| ArchiveError::Malformed("no Dublin Core in OAI record".into()))?;
    let first = |name: &str| {
        dc.find(name)
            .map(|e| e.text().trim().to_string())
            .filter(|t| !t.is_empty())
    };
    Ok(OaiRecord {
        title: first("title"),
        date: first("date"),
        descriptions: dc
            .find_all("description")
            .into_iter()
            .map(|e| e.text().trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
    })
}

/// `services/Pagination`: `<page><numero>label</numero><ordre>n</ordre></page>`.
pub fn parse_pagination(body: &str) -> Result<PageMap, ArchiveError> {
    let doc = parse_doc(body)?;
    let mut entries = Vec::new();
    for page in doc.find_all("page") {
        let label = page.find("numero").map(|e| e.text().trim().to_string());
        let ordinal = page
            .find("ordre")
            .and_then(|e| e.text().trim().parse::<u32>().ok());
        match (label, ordinal) {
            (Some(label), Some(ordinal)) => entries.push((label, ordinal)),
            _ => tracing::debug!("skipping page without numero/ordre"),
        }
    }
    if entries.is_empty() {
        return Err(ArchiveError::Malformed("pagination lists no pages".into()));
    }
    Ok(PageMap::new(entries))
}

fn number_attr(el: &xml::Element, name: &str) -> Result<u32, ArchiveError> {
    el.attr(name)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v.round() as u32)
        .ok_or_else(|| ArchiveError::Malformed(format!("ALTO {} lacks {name}", el.name)))
}

/// ALTO geometry: the printed area of the page on the OCR canvas.
pub fn parse_alto(body: &str) -> Result<UnscaledPageBounds, ArchiveError> {
    let doc = parse_doc(body)?;
    let page = doc
        .find("Page")
        .ok_or_else(|| ArchiveError::Malformed("ALTO without Page".into()))?;
    let space = page
        .find("PrintSpace")
        .ok_or_else(|| ArchiveError::Malformed("ALTO without PrintSpace".into()))?;
    let (x, y) = (number_attr(space, "HPOS")?, number_attr(space, "VPOS")?);
    Ok(UnscaledPageBounds {
        upper: (x, y),
        lower: (
            x + number_attr(space, "WIDTH")?,
            y + number_attr(space, "HEIGHT")?,
        ),
        total_width: number_attr(page, "WIDTH")?,
        total_height: number_attr(page, "HEIGHT")?,
    })
}

/// A usable TOC body, or `None` when the archive answered with a stub.
fn toc_markup(body: String) -> Option<String> {
    let trimmed = body.trim();
    if !trimmed.starts_with('<') || !trimmed.contains("</") {
        return None;
    }
    Some(body)
}

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static HEAD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style|head)\b.*?</(script|style|head)>").unwrap());

/// Plain text of an HTML transcription page.
pub fn strip_markup(html: &str) -> String {
    let without_head = HEAD_RE.replace_all(html, " ");
    let text = TAG_RE.replace_all(&without_head, " ");
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
