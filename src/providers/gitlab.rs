use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{FetchError, TrackerProvider};
use crate::model::record::{Link, LinkKind, Record, RecordId, RecordState};

pub struct GitLabProvider {
    base_url: String,
    token: String,
    labels: Vec<String>,
    client: reqwest::Client,
}

impl GitLabProvider {
    pub fn new(base_url: String, token: String, labels: Vec<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            labels,
            client: reqwest::Client::new(),
        }
    }

    fn project_url(&self, project: &str, tail: &str) -> String {
        format!(
            "{}/api/v4/projects/{}/{tail}",
            self.base_url,
            urlencoding::encode(project)
        )
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let resp = self
            .client
            .get(url)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::from_status(
                status,
                anyhow!("GET {url} returned {status}"),
            ));
        }
        let parsed = resp
            .json()
            .await
            .with_context(|| format!("parsing response of GET {url}"))
            .map_err(FetchError::Permanent)?;
        Ok(parsed)
    }

    /// Paginated listing; GitLab caps per_page at 100.
    async fn get_paginated<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<Vec<T>, FetchError> {
        let mut all = Vec::new();
        let mut page = 1;
        loop {
            let sep = if url.contains('?') { '&' } else { '?' };
            let paged = format!("{url}{sep}per_page=100&page={page}");
            let batch: Vec<T> = self.get_json(&paged).await?;
            let len = batch.len();
            all.extend(batch);
            if len < 100 {
                return Ok(all);
            }
            page += 1;
        }
    }
}

#[derive(Deserialize)]
struct GlIssue {
    iid: u64,
    title: String,
    state: String,
    #[serde(default)]
    labels: Vec<String>,
    author: GlAuthor,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    web_url: Option<String>,
}

#[derive(Deserialize)]
struct GlMergeRequest {
    iid: u64,
    title: String,
    state: String,
    #[serde(default)]
    labels: Vec<String>,
    author: GlAuthor,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    draft: bool,
    web_url: Option<String>,
}

#[derive(Deserialize)]
struct GlAuthor {
    username: String,
}

#[derive(Deserialize)]
struct GlIssueLink {
    iid: u64,
    link_type: Option<String>,
}

#[derive(Deserialize)]
struct GlRelatedMr {
    iid: u64,
}

fn parse_state(raw: &str) -> RecordState {
    match raw {
        "closed" => RecordState::Closed,
        "merged" => RecordState::Merged,
        _ => RecordState::Open,
    }
}

#[async_trait]
impl TrackerProvider for GitLabProvider {
    fn name(&self) -> &str {
        "GitLab"
    }

    async fn fetch_records(&self, project: &str) -> Result<Vec<Record>, FetchError> {
        let label_filter = if self.labels.is_empty() {
            String::new()
        } else {
            format!("&labels={}", urlencoding::encode(&self.labels.join(",")))
        };

        let issues_url = format!(
            "{}?state=opened{label_filter}",
            self.project_url(project, "issues")
        );
        let mrs_url = format!(
            "{}?state=opened{label_filter}",
            self.project_url(project, "merge_requests")
        );
        let (issues, mrs): (Vec<GlIssue>, Vec<GlMergeRequest>) = tokio::try_join!(
            self.get_paginated(&issues_url),
            self.get_paginated(&mrs_url)
        )?;

        let mut records = Vec::with_capacity(issues.len() + mrs.len());
        for issue in issues {
            records.push(Record {
                id: RecordId::issue(project, issue.iid),
                title: issue.title,
                state: parse_state(&issue.state),
                labels: issue.labels.into_iter().collect(),
                author: issue.author.username,
                created_at: issue.created_at,
                updated_at: issue.updated_at,
                draft: false,
                url: issue.web_url,
                oldest_unresolved_discussion: None,
            });
        }
        for mr in mrs {
            records.push(Record {
                id: RecordId::merge_request(project, mr.iid),
                title: mr.title,
                state: parse_state(&mr.state),
                labels: mr.labels.into_iter().collect(),
                author: mr.author.username,
                created_at: mr.created_at,
                updated_at: mr.updated_at,
                draft: mr.draft,
                url: mr.web_url,
                oldest_unresolved_discussion: None,
            });
        }
        log::info!("{project}: fetched {} records", records.len());
        Ok(records)
    }

    async fn fetch_links(&self, project: &str) -> Result<Vec<Link>, FetchError> {
        // Links are only listed per issue, so walk the issues we track.
        let label_filter = if self.labels.is_empty() {
            String::new()
        } else {
            format!("&labels={}", urlencoding::encode(&self.labels.join(",")))
        };
        let issues_url = format!(
            "{}?state=opened{label_filter}",
            self.project_url(project, "issues")
        );
        let issues: Vec<GlIssue> = self.get_paginated(&issues_url).await?;

        let mut links = Vec::new();
        for issue in &issues {
            let from = RecordId::issue(project, issue.iid);

            let linked: Vec<GlIssueLink> = self
                .get_paginated(&self.project_url(project, &format!("issues/{}/links", issue.iid)))
                .await?;
            for other in linked {
                let kind = LinkKind::parse(other.link_type.as_deref().unwrap_or("relates_to"));
                links.push(Link {
                    from: from.clone(),
                    to: RecordId::issue(project, other.iid),
                    kind,
                });
            }

            // A merge request the tracker relates to an issue is part of that
            // issue's unit of work.
            let related: Vec<GlRelatedMr> = self
                .get_paginated(&self.project_url(
                    project,
                    &format!("issues/{}/related_merge_requests", issue.iid),
                ))
                .await?;
            for mr in related {
                links.push(Link {
                    from: RecordId::merge_request(project, mr.iid),
                    to: from.clone(),
                    kind: LinkKind::PartOf,
                });
            }
        }
        log::info!("{project}: fetched {} links", links.len());
        Ok(links)
    }
}
