use rand::seq::SliceRandom;
use rand::Rng;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
];

const VIEWPORTS: &[(u32, u32)] = &[
    (1920, 1080),
    (1366, 768),
    (1536, 864),
    (1440, 900),
    (1600, 900),
    (2560, 1440),
];

const LANGUAGES: &[&str] = &["en-US,en;q=0.9", "en-CA,en;q=0.9", "en-GB,en;q=0.9"];

const TIMEZONES: &[&str] = &[
    "America/Toronto",
    "America/Vancouver",
    "America/New_York",
    "America/Chicago",
    "America/Edmonton",
];

pub struct UserAgentGenerator;

impl UserAgentGenerator {
    pub fn random_user_agent() -> &'static str {
        USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0])
    }
}

/// One randomized browser identity, drawn fresh per session so repeated
/// daily runs don't present the same fingerprint.
#[derive(Debug, Clone)]
pub struct BrowserFingerprint {
    pub user_agent: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub language: String,
    pub timezone: String,
    pub platform: String,
    pub hardware_concurrency: u32,
    pub device_memory: u32,
}

pub struct FingerprintRandomizer;

impl FingerprintRandomizer {
    pub fn generate() -> BrowserFingerprint {
        let mut rng = rand::thread_rng();
        let (viewport_width, viewport_height) =
            *VIEWPORTS.choose(&mut rng).unwrap_or(&VIEWPORTS[0]);
        let user_agent = UserAgentGenerator::random_user_agent().to_string();
        // platform must agree with the user agent string
        let platform = if user_agent.contains("Windows") {
            "Win32"
        } else if user_agent.contains("Macintosh") {
            "MacIntel"
        } else {
            "Linux x86_64"
        };

        BrowserFingerprint {
            user_agent,
            viewport_width,
            viewport_height,
            language: LANGUAGES
                .choose(&mut rng)
                .copied()
                .unwrap_or(LANGUAGES[0])
                .to_string(),
            timezone: TIMEZONES
                .choose(&mut rng)
                .copied()
                .unwrap_or(TIMEZONES[0])
                .to_string(),
            platform: platform.to_string(),
            hardware_concurrency: rng.gen_range(4..=16),
            device_memory: *[4u32, 8, 16, 32].choose(&mut rng).unwrap_or(&8),
        }
    }
}

/// Script injected after each navigation so the page sees an ordinary
/// browser instead of an automated one.
pub fn generate_stealth_script(fingerprint: &BrowserFingerprint) -> String {
    let primary_language = fingerprint
        .language
        .split(',')
        .next()
        .unwrap_or("en-US")
        .to_string();
    let language_list = fingerprint.language.replace(";q=0.9", "");

    format!(
        r#"
    (function() {{
        Object.defineProperty(navigator, 'language', {{ value: '{primary}', writable: false }});
        Object.defineProperty(navigator, 'languages', {{ value: ['{list}'], writable: false }});
        Object.defineProperty(navigator, 'platform', {{ value: '{platform}', writable: false }});
        Object.defineProperty(navigator, 'hardwareConcurrency', {{ value: {cores}, writable: false }});
        Object.defineProperty(navigator, 'deviceMemory', {{ value: {memory}, writable: false }});

        // Hide webdriver property
        Object.defineProperty(navigator, 'webdriver', {{ get: () => undefined }});

        // Override plugins
        Object.defineProperty(navigator, 'plugins', {{
            value: [
                {{ name: 'Chrome PDF Plugin', description: 'Portable Document Format' }},
                {{ name: 'Chrome PDF Viewer', description: 'PDF Viewer' }},
                {{ name: 'Native Client', description: 'Native Client' }}
            ],
            writable: false
        }});

        // Override permissions
        const originalQuery = navigator.permissions.query;
        navigator.permissions.query = function(parameters) {{
            return parameters.name === 'notifications'
                ? Promise.resolve({{ state: Notification.permission }})
                : originalQuery.call(this, parameters);
        }};

        // Hide automation indicators
        delete window.cdc_adoQpoasnfa76pfcZLmcfl_Array;
        delete window.cdc_adoQpoasnfa76pfcZLmcfl_Promise;
        delete window.cdc_adoQpoasnfa76pfcZLmcfl_Symbol;
    }})();
    "#,
        primary = primary_language,
        list = language_list.replace(',', "', '"),
        platform = fingerprint.platform,
        cores = fingerprint.hardware_concurrency,
        memory = fingerprint.device_memory,
    )
}
