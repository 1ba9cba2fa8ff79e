mod support;

use coin_tracker_lib::error::AppError;
use coin_tracker_lib::market::board::{CoinGeckoMarkets, MarketDataSource};
use coin_tracker_lib::market::spot::{SpotAsset, SpotPriceChain};
use reqwest::Client;
use std::time::Duration;
use support::{MockHttp, Route};

const SIMPLE_PRICE: &str = "/api/v3/simple/price";
const TICKER_PRICE: &str = "/api/v3/ticker/price";
const COINBASE_SPOT: &str = "/v2/prices/BTC-USD/spot";
const COIN_MARKETS: &str = "/api/v3/coins/markets";

struct Upstreams {
    coingecko: MockHttp,
    binance: MockHttp,
    coinbase: MockHttp,
}

impl Upstreams {
    async fn start() -> Self {
        Self {
            coingecko: MockHttp::start().await,
            binance: MockHttp::start().await,
            coinbase: MockHttp::start().await,
        }
    }

    fn chain(&self) -> SpotPriceChain {
        SpotPriceChain::standard(
            Client::new(),
            self.coingecko.base_url(),
            self.binance.base_url(),
            self.coinbase.base_url(),
            Duration::from_secs(2),
        )
    }
}

fn bitcoin() -> SpotAsset {
    SpotAsset::new("bitcoin", "btc").expect("valid asset")
}

#[tokio::test]
async fn first_tier_answer_wins() {
    let upstreams = Upstreams::start().await;
    upstreams
        .coingecko
        .route(SIMPLE_PRICE, Route::ok(r#"{"bitcoin":{"usd":64250.5}}"#));

    let quote = upstreams
        .chain()
        .latest_price(&bitcoin())
        .await
        .expect("coingecko quote");

    assert_eq!(quote.price, 64_250.5);
    assert_eq!(quote.source, "coingecko");
    assert_eq!(upstreams.binance.requests().len(), 0);
    assert_eq!(
        upstreams.coingecko.requests(),
        vec!["/api/v3/simple/price?ids=bitcoin&vs_currencies=usd".to_string()]
    );
}

#[tokio::test]
async fn rate_limited_primary_falls_back_to_binance() {
    let upstreams = Upstreams::start().await;
    upstreams.coingecko.route(SIMPLE_PRICE, Route::status(429));
    upstreams
        .binance
        .route(TICKER_PRICE, Route::ok(r#"{"symbol":"BTCUSDT","price":"64100.10"}"#));

    let quote = upstreams
        .chain()
        .latest_price(&bitcoin())
        .await
        .expect("binance quote");

    assert_eq!(quote.source, "binance");
    assert!((quote.price - 64_100.10).abs() < 1e-9);
    assert_eq!(
        upstreams.binance.requests(),
        vec!["/api/v3/ticker/price?symbol=BTCUSDT".to_string()]
    );
    assert_eq!(upstreams.coinbase.requests().len(), 0);
}

#[tokio::test]
async fn coinbase_is_the_last_resort() {
    let upstreams = Upstreams::start().await;
    upstreams
        .coingecko
        .route(SIMPLE_PRICE, Route::ok(r#"{"ethereum":{"usd":3000.0}}"#));
    upstreams.binance.route(TICKER_PRICE, Route::status(451));
    upstreams.coinbase.route(
        COINBASE_SPOT,
        Route::ok(r#"{"data":{"base":"BTC","currency":"USD","amount":"63990.01"}}"#),
    );

    let quote = upstreams
        .chain()
        .latest_price(&bitcoin())
        .await
        .expect("coinbase quote");

    assert_eq!(quote.source, "coinbase");
    assert!((quote.price - 63_990.01).abs() < 1e-9);
}

#[tokio::test]
async fn all_tiers_failing_names_each_source() {
    let upstreams = Upstreams::start().await;
    upstreams.coingecko.route(SIMPLE_PRICE, Route::status(500));
    upstreams.binance.route(TICKER_PRICE, Route::status(451));
    upstreams.coinbase.route(COINBASE_SPOT, Route::ok("not json"));

    let result = upstreams.chain().latest_price(&bitcoin()).await;

    match result {
        Err(AppError::AllSourcesFailed(detail)) => {
            assert!(detail.contains("coingecko"));
            assert!(detail.contains("binance"));
            assert!(detail.contains("coinbase"));
        }
        other => panic!("expected AllSourcesFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn coin_markets_decode_with_missing_fields() {
    let coingecko = MockHttp::start().await;
    coingecko.route(
        COIN_MARKETS,
        Route::ok(
            r#"[
                {"id":"bitcoin","symbol":"btc","name":"Bitcoin","image":"https://img/btc.png",
                 "current_price":64000.0,"market_cap":1.26e12,"market_cap_rank":1,
                 "price_change_percentage_24h":-1.25,"sparkline_in_7d":{"price":[63000.0,63500.5,64000.0]},
                 "total_volume":31000000000},
                {"id":"newcoin","symbol":"new","name":"New Coin","image":null,
                 "current_price":null,"market_cap":null,"market_cap_rank":null,
                 "price_change_percentage_24h":null}
            ]"#,
        ),
    );
    let source = CoinGeckoMarkets::new(Client::new(), coingecko.base_url(), Duration::from_secs(2));

    let wanted = vec!["bitcoin".to_string(), "newcoin".to_string()];
    let markets = source
        .markets(Some(wanted.as_slice()))
        .await
        .expect("markets decode");

    assert_eq!(markets.len(), 2);
    assert_eq!(markets[0].market_cap_rank, Some(1));
    assert_eq!(
        markets[0]
            .sparkline_in_7d
            .as_ref()
            .map(|sparkline| sparkline.price.len()),
        Some(3)
    );
    assert_eq!(markets[1].current_price, None);
    assert!(markets[1].sparkline_in_7d.is_none());

    let requests = coingecko.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].contains("sparkline=true"));
    assert!(requests[0].ends_with("&ids=bitcoin,newcoin"));
}
