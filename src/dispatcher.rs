use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};

use crate::listener::TriggerHandler;
use crate::messages::{
    CoverImage, CoverImageRef, NowPlayingInfo, Post, PublishResult, PublisherOutcome,
};

/// Edge length Spotify uses for its largest album art.
const PREFERRED_COVER_SIZE: u32 = 640;

pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait NowPlayingSource: Send + Sync {
    /// `Ok(None)` means nothing is playing right now.
    async fn currently_playing(&self) -> anyhow::Result<Option<NowPlayingInfo>>;
}

#[async_trait]
pub trait CoverFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<CoverImage>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, post: &Post) -> anyhow::Result<()>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum DispatchReport {
    NothingPlaying,
    Aborted(String),
    Published(Vec<PublisherOutcome>),
}

pub struct Dispatcher {
    now_playing: Box<dyn NowPlayingSource>,
    covers: Box<dyn CoverFetcher>,
    publishers: Vec<Box<dyn Publisher>>,
    footer: String,
    publish_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        now_playing: Box<dyn NowPlayingSource>,
        covers: Box<dyn CoverFetcher>,
        publishers: Vec<Box<dyn Publisher>>,
        footer: impl Into<String>,
    ) -> Self {
        Dispatcher {
            now_playing,
            covers,
            publishers,
            footer: footer.into(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    /// Upper bound on a single publisher call; a publisher that overruns it is
    /// recorded as failed and the next one runs.
    pub fn with_publish_timeout(mut self, publish_timeout: Duration) -> Self {
        self.publish_timeout = publish_timeout;
        self
    }

    /// Fans one trigger out to every publisher. Publisher failures are recorded
    /// per publisher and never stop the remaining ones; nothing is rolled back.
    pub async fn dispatch(&self) -> DispatchReport {
        let info = match self.now_playing.currently_playing().await {
            Ok(Some(info)) => info,
            Ok(None) => {
                info!("No track is currently playing.");
                return DispatchReport::NothingPlaying;
            }
            Err(err) => {
                return DispatchReport::Aborted(format!("now-playing query failed: {err:#}"));
            }
        };

        let Some(cover) = select_cover(&info.images) else {
            return DispatchReport::Aborted(format!(
                "no cover image for album '{}'",
                info.album_name
            ));
        };
        let image = match self.covers.fetch(&cover.url).await {
            Ok(image) => Arc::new(image),
            Err(err) => return DispatchReport::Aborted(format!("cover fetch failed: {err:#}")),
        };

        let post = Post {
            text: post_text(&info, &self.footer),
            alt_text: alt_text(&info),
            image,
        };
        info!("Posting: {}", post.text);

        let mut outcomes = Vec::with_capacity(self.publishers.len());
        for publisher in &self.publishers {
            let published = tokio::time::timeout(self.publish_timeout, publisher.publish(&post))
                .await
                .unwrap_or_else(|_| {
                    Err(anyhow::anyhow!("timed out after {:?}", self.publish_timeout))
                });
            let result = match published {
                Ok(()) => {
                    info!("Uploaded to {}!", publisher.name());
                    PublishResult::Success
                }
                Err(err) => {
                    error!("Publishing to {} failed: {:#}", publisher.name(), err);
                    PublishResult::Failure(format!("{err:#}"))
                }
            };
            outcomes.push(PublisherOutcome {
                publisher: publisher.name().to_string(),
                result,
            });
        }
        DispatchReport::Published(outcomes)
    }
}

#[async_trait]
impl TriggerHandler for Dispatcher {
    async fn on_trigger(&self) {
        match self.dispatch().await {
            DispatchReport::NothingPlaying => {}
            DispatchReport::Aborted(reason) => warn!("Dispatch aborted: {}", reason),
            DispatchReport::Published(outcomes) => {
                let failed: Vec<&str> = outcomes
                    .iter()
                    .filter(|o| o.result != PublishResult::Success)
                    .map(|o| o.publisher.as_str())
                    .collect();
                if failed.is_empty() {
                    info!("Published to all {} platforms", outcomes.len());
                } else {
                    warn!(
                        "Published to {} of {} platforms; failed: {}",
                        outcomes.len() - failed.len(),
                        outcomes.len(),
                        failed.join(", ")
                    );
                }
            }
        }
    }
}

/// Splits a playback position into `(seconds, minutes)`.
///
/// Minutes wrap at 60: positions past an hour are truncated, not rolled into hours.
pub fn convert_millis(millis: u64) -> (u64, u64) {
    let seconds = (millis / 1000) % 60;
    let minutes = (millis / 60_000) % 60;
    (seconds, minutes)
}

pub fn post_text(info: &NowPlayingInfo, footer: &str) -> String {
    let (seconds, minutes) = convert_millis(info.progress_ms);
    format!(
        "Currently playing: '{}' by {} ({:02}:{:02})\n\n{}",
        info.track_name.as_deref().unwrap_or("Unknown track"),
        info.artists.join(", "),
        minutes,
        seconds,
        footer
    )
}

pub fn alt_text(info: &NowPlayingInfo) -> String {
    format!(
        "Album cover for '{}' by {}.",
        info.album_name,
        info.album_artists
            .first()
            .map(String::as_str)
            .unwrap_or("an unknown artist")
    )
}

/// Prefers the exact 640x640 rendition, otherwise the first one offered.
pub fn select_cover(images: &[CoverImageRef]) -> Option<&CoverImageRef> {
    images
        .iter()
        .find(|img| {
            img.width == Some(PREFERRED_COVER_SIZE) && img.height == Some(PREFERRED_COVER_SIZE)
        })
        .or_else(|| images.first())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;

    use super::*;
    use Behaviour::{Fail, Hang, Succeed};

    fn cover(url: &str, size: u32) -> CoverImageRef {
        CoverImageRef {
            url: url.to_string(),
            width: Some(size),
            height: Some(size),
        }
    }

    fn track() -> NowPlayingInfo {
        NowPlayingInfo {
            track_name: Some("Windowlicker".to_string()),
            artists: vec!["Aphex Twin".to_string(), "Guest".to_string()],
            album_name: "Windowlicker EP".to_string(),
            album_artists: vec!["Aphex Twin".to_string()],
            progress_ms: 125_000,
            images: vec![cover("small", 64), cover("large", 640), cover("medium", 300)],
        }
    }

    struct FakeSource(anyhow::Result<Option<NowPlayingInfo>>, Arc<AtomicUsize>);

    #[async_trait]
    impl NowPlayingSource for FakeSource {
        async fn currently_playing(&self) -> anyhow::Result<Option<NowPlayingInfo>> {
            self.1.fetch_add(1, Ordering::SeqCst);
            match &self.0 {
                Ok(info) => Ok(info.clone()),
                Err(_) => Err(anyhow::anyhow!("401 unauthorized")),
            }
        }
    }

    #[derive(Default)]
    struct FakeCovers {
        fetched: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl CoverFetcher for Arc<FakeCovers> {
        async fn fetch(&self, url: &str) -> anyhow::Result<CoverImage> {
            self.fetched.lock().unwrap().push(url.to_string());
            if self.fail {
                anyhow::bail!("connection reset");
            }
            Ok(CoverImage {
                bytes: Bytes::from_static(&[0xFF, 0xD8, 0xFF]),
                mime: "image/jpeg",
            })
        }
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        Fail,
        Hang,
    }

    struct FakePublisher {
        name: String,
        behaviour: Behaviour,
        posts: Arc<Mutex<Vec<Post>>>,
    }

    #[async_trait]
    impl Publisher for FakePublisher {
        fn name(&self) -> &str {
            &self.name
        }

        async fn publish(&self, post: &Post) -> anyhow::Result<()> {
            self.posts.lock().unwrap().push(post.clone());
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => anyhow::bail!("rate limited"),
                Behaviour::Hang => std::future::pending().await,
            }
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        queries: Arc<AtomicUsize>,
        covers: Arc<FakeCovers>,
        posts: Vec<Arc<Mutex<Vec<Post>>>>,
    }

    fn harness(
        source: anyhow::Result<Option<NowPlayingInfo>>,
        cover_fails: bool,
        behaviours: &[Behaviour],
    ) -> Harness {
        let queries = Arc::new(AtomicUsize::new(0));
        let covers = Arc::new(FakeCovers {
            fail: cover_fails,
            ..Default::default()
        });
        let mut posts = Vec::new();
        let mut publishers: Vec<Box<dyn Publisher>> = Vec::new();
        for (i, behaviour) in behaviours.iter().enumerate() {
            let log = Arc::new(Mutex::new(Vec::new()));
            posts.push(log.clone());
            publishers.push(Box::new(FakePublisher {
                name: format!("publisher-{i}"),
                behaviour: *behaviour,
                posts: log,
            }));
        }
        let dispatcher = Dispatcher::new(
            Box::new(FakeSource(source, queries.clone())),
            Box::new(covers.clone()),
            publishers,
            "(Automated Post)",
        );
        Harness {
            dispatcher,
            queries,
            covers,
            posts,
        }
    }

    fn publish_counts(h: &Harness) -> Vec<usize> {
        h.posts.iter().map(|p| p.lock().unwrap().len()).collect()
    }

    #[test]
    fn test_convert_millis() {
        assert_eq!(convert_millis(125_000), (5, 2));
        assert_eq!(convert_millis(59_000), (59, 0));
        assert_eq!(convert_millis(3_600_000), (0, 0));
        assert_eq!(convert_millis(999), (0, 0));
    }

    #[test]
    fn test_post_and_alt_text() {
        let info = track();
        assert_eq!(
            post_text(&info, "(bot)"),
            "Currently playing: 'Windowlicker' by Aphex Twin, Guest (02:05)\n\n(bot)"
        );
        assert_eq!(alt_text(&info), "Album cover for 'Windowlicker EP' by Aphex Twin.");

        let anonymous = NowPlayingInfo {
            track_name: None,
            album_artists: vec![],
            ..info
        };
        assert!(post_text(&anonymous, "").starts_with("Currently playing: 'Unknown track'"));
        assert_eq!(
            alt_text(&anonymous),
            "Album cover for 'Windowlicker EP' by an unknown artist."
        );
    }

    #[test]
    fn test_select_cover_prefers_640_square() {
        let images = track().images;
        assert_eq!(select_cover(&images).unwrap().url, "large");

        let no_large = vec![cover("small", 64), cover("medium", 300)];
        assert_eq!(select_cover(&no_large).unwrap().url, "small");
        assert!(select_cover(&[]).is_none());
    }

    #[tokio::test]
    async fn test_nothing_playing_publishes_nothing() {
        let h = harness(Ok(None), false, &[Succeed, Succeed]);
        assert_eq!(h.dispatcher.dispatch().await, DispatchReport::NothingPlaying);
        assert_eq!(publish_counts(&h), vec![0, 0]);
        assert!(h.covers.fetched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_failing_publisher_does_not_block_the_other() {
        let h = harness(Ok(Some(track())), false, &[Fail, Succeed]);
        let report = h.dispatcher.dispatch().await;
        assert_eq!(
            report,
            DispatchReport::Published(vec![
                PublisherOutcome {
                    publisher: "publisher-0".to_string(),
                    result: PublishResult::Failure("rate limited".to_string()),
                },
                PublisherOutcome {
                    publisher: "publisher-1".to_string(),
                    result: PublishResult::Success,
                },
            ])
        );
        assert_eq!(publish_counts(&h), vec![1, 1]);
    }

    #[tokio::test]
    async fn test_hung_publisher_times_out_and_others_still_run() {
        let mut h = harness(Ok(Some(track())), false, &[Hang, Fail, Succeed]);
        h.dispatcher = h.dispatcher.with_publish_timeout(Duration::from_millis(50));

        let report = tokio::time::timeout(Duration::from_secs(5), h.dispatcher.dispatch())
            .await
            .expect("dispatch must return even if a publisher hangs");
        let DispatchReport::Published(outcomes) = report else {
            panic!("expected a published report, got {report:?}");
        };
        let results: Vec<_> = outcomes.into_iter().map(|o| o.result).collect();
        assert!(matches!(
            &results[0],
            PublishResult::Failure(reason) if reason.contains("timed out")
        ));
        assert_eq!(results[1], PublishResult::Failure("rate limited".to_string()));
        assert_eq!(results[2], PublishResult::Success);
        assert_eq!(publish_counts(&h), vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn test_cover_fetched_once_and_shared() {
        let h = harness(Ok(Some(track())), false, &[Succeed, Succeed, Succeed]);
        h.dispatcher.dispatch().await;
        assert_eq!(*h.covers.fetched.lock().unwrap(), vec!["large".to_string()]);

        let first = h.posts[0].lock().unwrap()[0].clone();
        for log in &h.posts[1..] {
            let post = &log.lock().unwrap()[0];
            assert!(Arc::ptr_eq(&first.image, &post.image));
            assert_eq!(first.text, post.text);
            assert_eq!(first.alt_text, post.alt_text);
        }
    }

    #[tokio::test]
    async fn test_collaborator_failures_abort_without_publishing() {
        let h = harness(Err(anyhow::anyhow!("unused")), false, &[Succeed]);
        assert!(matches!(h.dispatcher.dispatch().await, DispatchReport::Aborted(_)));
        assert_eq!(h.queries.load(Ordering::SeqCst), 1);

        let h = harness(Ok(Some(track())), true, &[Succeed]);
        assert!(matches!(h.dispatcher.dispatch().await, DispatchReport::Aborted(_)));
        assert_eq!(publish_counts(&h), vec![0]);

        let bare = NowPlayingInfo {
            images: vec![],
            ..track()
        };
        let h = harness(Ok(Some(bare)), false, &[Succeed]);
        assert!(matches!(h.dispatcher.dispatch().await, DispatchReport::Aborted(_)));
        assert_eq!(publish_counts(&h), vec![0]);
    }

    #[tokio::test]
    async fn test_repeated_triggers_publish_each_time() {
        let h = harness(Ok(Some(track())), false, &[Succeed]);
        h.dispatcher.on_trigger().await;
        h.dispatcher.on_trigger().await;
        assert_eq!(h.queries.load(Ordering::SeqCst), 2);
        assert_eq!(publish_counts(&h), vec![2]);
    }
}
