use clap::{Arg, ArgAction, Command};
use pageview_import::ident::generate_id;
use rand::Rng;
use std::io::{self, Write};

const HEADER: &str = "datapoint,added_iso,uuid,session_id,hostname,path,query,\
is_unique,is_robot,document_referrer,utm_source,country_code,browser_name,\
os_name,device_type,screen_width,duration_seconds";

const PATHS: &[&str] = &["/", "/pricing", "/blog", "/blog/launch", "/docs", "/docs/install", "/about"];
const REFERRERS: &[&str] = &[
    "",
    "https://www.google.com/search?q=analytics",
    "https://news.ycombinator.com/",
    "https://t.co/xyz",
    "https://mail.google.com/",
];
const COUNTRIES: &[&str] = &["US", "DE", "FR", "GB", "JP", "XX"];
const BROWSERS: &[&str] = &["Chrome", "Firefox", "Safari", "Edge"];
const OSES: &[&str] = &["Windows", "macOS", "Linux", "iOS", "Android"];

fn main() -> anyhow::Result<()> {
    let matches = Command::new("gen")
        .about("Write a synthetic pageview CSV export to stdout")
        .arg(
            Arg::new("rows")
                .long("rows")
                .value_parser(clap::value_parser!(u64))
                .required(true),
        )
        .arg(
            Arg::new("non-pageview-every")
                .long("non-pageview-every")
                .help("Emit an `event` row every N rows")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("invalid-every")
                .long("invalid-every")
                .help("Emit a row with a relative path every N rows")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("legacy-ids")
                .long("legacy-ids")
                .help("Use UUIDv4-style identifiers instead of canonical ones")
                .action(ArgAction::SetTrue),
        )
        .arg(Arg::new("hostname").long("hostname").default_value("example.com"))
        .get_matches();

    let rows: u64 = *matches
        .get_one("rows")
        .ok_or_else(|| anyhow::anyhow!("Provide --rows <n>"))?;
    let non_pageview_every = matches.get_one::<u64>("non-pageview-every").copied();
    let invalid_every = matches.get_one::<u64>("invalid-every").copied();
    let legacy_ids = matches.get_flag("legacy-ids");
    let hostname = matches
        .get_one::<String>("hostname")
        .map(String::as_str)
        .unwrap_or("example.com");

    let every = |n: Option<u64>, i: u64| n.is_some_and(|n| n > 0 && (i + 1) % n == 0);
    let start = chrono::Utc::now() - chrono::Duration::days(30);
    let mut rng = rand::thread_rng();
    let mut out = io::BufWriter::new(io::stdout().lock());

    writeln!(&mut out, "{HEADER}")?;
    for i in 0..rows {
        let datapoint = if every(non_pageview_every, i) { "event" } else { "pageview" };
        let added = start + chrono::Duration::seconds(i as i64 * 7);
        let id = if legacy_ids {
            let v: u128 = rng.gen();
            let h = format!("{v:032x}");
            format!("{}-{}-{}-{}-{}", &h[..8], &h[8..12], &h[12..16], &h[16..20], &h[20..])
        } else {
            generate_id()
        };
        let session = format!("s{:06}", i / 5);
        let path = PATHS[rng.gen_range(0..PATHS.len())];
        let path = if every(invalid_every, i) {
            path.trim_start_matches('/').to_string()
        } else {
            path.to_string()
        };
        let width: i64 = [375, 820, 1440, 1920][rng.gen_range(0..4)];

        writeln!(
            &mut out,
            "{datapoint},{},{id},{session},{hostname},{path},,{},{},{},{},{},{},{},,{width},{}",
            added.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            i % 5 == 0,
            rng.gen_bool(0.02),
            REFERRERS[rng.gen_range(0..REFERRERS.len())],
            if i % 3 == 0 { "newsletter" } else { "" },
            COUNTRIES[rng.gen_range(0..COUNTRIES.len())],
            BROWSERS[rng.gen_range(0..BROWSERS.len())],
            OSES[rng.gen_range(0..OSES.len())],
            rng.gen_range(0..600),
        )?;
        if i % 10_000 == 0 {
            out.flush()?;
        }
    }

    out.flush()?;
    Ok(())
}
