//! Ports - 抽象化レイヤー
//!
//! 外部システム（ストレージ、ヘッドレスブラウザ、画像取得）へのインターフェース。
//! app 層はこの trait だけに依存し、実装（impls）はテストで差し替えられる。

pub mod browser;
pub mod image_fetcher;
pub mod price_store;

pub use self::browser::{BrowserLauncher, BrowserSession, PricePage, PricePayload, PriceSubscription};
pub use self::image_fetcher::ImageFetcher;
pub use self::price_store::{PriceStore, StoreError};
