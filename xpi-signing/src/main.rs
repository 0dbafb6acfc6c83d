// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    chrono::{DateTime, Datelike, Duration, Utc},
    clap::{Arg, ArgMatches, Command},
    log::{info, LevelFilter},
    rand::rngs::OsRng,
    rsa::RsaPrivateKey,
    std::{path::PathBuf, str::FromStr},
    x509_certificate::{
        certificate::KeyUsage,
        rfc4519::{OID_COMMON_NAME, OID_ORGANIZATIONAL_UNIT_NAME},
        EcdsaCurve, InMemorySigningKeyPair,
    },
    xpi_signing::{
        archive,
        certificate::{CertificateTemplate, OID_EKU_PURPOSE_CODE_SIGNING},
        cose::verify_cose_signatures,
        manifest,
        signer::{generate_ecdsa_pkcs8, rsa_pkcs8},
        verify::{extract_signature, verify_signed_file_with_trust},
        CoseAlgorithm, SignerConfiguration, SigningOptions, TrustStore, XpiSigner,
        XpiSigningError,
    },
};

const SIGN_ABOUT: &str = "\
Sign an XPI archive.

The signer is described by a YAML (or JSON, by .json extension) file with
the fields `type` (must be `xpi`), `id`, `privatekey` (PEM), `certificate`
(PEM), and `mode` (one of `add-on`, `extension`, `system add-on`,
`hotfix`).

Any existing signature in the input is replaced.
";

const VERIFY_ABOUT: &str = "\
Verify the PKCS#7 signature of a signed XPI.

The signature is checked against the signature file, the signature file
against the manifest, and the manifest against the archive content.

Without --trust-anchor the certificates embedded in the signature are
trusted as is. With it, the signer certificate must chain to one of the
given certificates.
";

const VERIFY_COSE_ABOUT: &str = "\
Check the structure of the COSE signature of a signed XPI.

One --algorithm must be given per expected signature. Certificate chains
are decoded but not validated against any root.
";

const GENERATE_TEST_ISSUER_ABOUT: &str = "\
Generate a self-signed issuer certificate and private key.

The certificate satisfies every check applied when constructing a signer
and is intended for testing only.
";

fn command_sign(args: &ArgMatches) -> Result<(), XpiSigningError> {
    let config_path = args
        .value_of("config")
        .ok_or_else(|| XpiSigningError::CliBadArgument("--config is required".into()))?;
    let input_path = args
        .value_of("input")
        .ok_or_else(|| XpiSigningError::CliBadArgument("input path is required".into()))?;
    let output_path = args
        .value_of("output")
        .ok_or_else(|| XpiSigningError::CliBadArgument("output path is required".into()))?;

    let signer = XpiSigner::from_config(SignerConfiguration::from_path(config_path)?)?;

    let options = match args.value_of("id") {
        Some(id) => SigningOptions::new(id),
        None => SigningOptions::default(),
    };

    let input = std::fs::read(input_path)?;
    let signed = signer.sign_file(&input, &options)?;

    info!("writing signed XPI to {}", output_path);
    std::fs::write(output_path, signed)?;

    Ok(())
}

fn command_verify(args: &ArgMatches) -> Result<(), XpiSigningError> {
    let input_path = args
        .value_of("input")
        .ok_or_else(|| XpiSigningError::CliBadArgument("input path is required".into()))?;

    let trust = if let Some(paths) = args.values_of("trust_anchor") {
        let mut store = TrustStore::default();
        for path in paths {
            for cert in TrustStore::from_pem(std::fs::read(path)?)?.anchors() {
                store.add(cert.clone());
            }
        }
        Some(store)
    } else {
        None
    };

    let signed = std::fs::read(input_path)?;
    verify_signed_file_with_trust(&signed, trust.as_ref())?;

    let signature = extract_signature(&signed)?;
    for cert in signature.certificates()? {
        println!(
            "certificate: {}",
            cert.subject_common_name()
                .unwrap_or_else(|| "<no common name>".into())
        );
    }

    if args.is_present("print_pem") {
        print!("{}", signature.to_pem()?);
    }

    println!("signature OK");

    Ok(())
}

fn command_verify_cose(args: &ArgMatches) -> Result<(), XpiSigningError> {
    let input_path = args
        .value_of("input")
        .ok_or_else(|| XpiSigningError::CliBadArgument("input path is required".into()))?;

    let cose_algorithms = args
        .values_of("algorithm")
        .map(|values| {
            values
                .map(|s| CoseAlgorithm::from_str(s).map(|alg| alg.name().to_string()))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();

    let options = SigningOptions {
        cose_algorithms,
        ..Default::default()
    };

    let signed = std::fs::read(input_path)?;
    let certs = verify_cose_signatures(&signed, &options)?;

    for cert in &certs.intermediates {
        println!(
            "intermediate: {}",
            cert.subject_common_name()
                .unwrap_or_else(|| "<no common name>".into())
        );
    }
    for cert in &certs.end_entities {
        println!(
            "end-entity: {}",
            cert.subject_common_name()
                .unwrap_or_else(|| "<no common name>".into())
        );
    }

    println!("COSE envelope structure OK");

    Ok(())
}

fn command_print_manifest(args: &ArgMatches) -> Result<(), XpiSigningError> {
    let input_path = args
        .value_of("input")
        .ok_or_else(|| XpiSigningError::CliBadArgument("input path is required".into()))?;

    let data = std::fs::read(input_path)?;
    let manifest = manifest::build_manifest(&data)?;
    let signature_file = manifest::build_signature_file(&manifest);

    println!("# {}", archive::MANIFEST_PATH);
    print!("{}", String::from_utf8_lossy(&manifest));
    println!("# {}", archive::SIGNATURE_FILE_PATH);
    print!("{}", String::from_utf8_lossy(&signature_file));

    Ok(())
}

/// Resolve `--validity-days` into the end of a validity window starting at `now`.
fn validity_end(now: DateTime<Utc>, value: &str) -> Result<DateTime<Utc>, XpiSigningError> {
    let days = i64::from_str(value)
        .map_err(|e| XpiSigningError::CliBadArgument(format!("--validity-days: {}", e)))?;

    if days <= 0 {
        return Err(XpiSigningError::CliBadArgument(
            "--validity-days must be positive".into(),
        ));
    }

    // Certificate times can't represent years past 9999.
    Duration::try_days(days)
        .and_then(|validity| now.checked_add_signed(validity))
        .filter(|end| end.year() <= 9999)
        .ok_or_else(|| {
            XpiSigningError::CliBadArgument(format!("--validity-days: {} is out of range", days))
        })
}

fn command_generate_test_issuer(args: &ArgMatches) -> Result<(), XpiSigningError> {
    let pkcs8 = match args
        .value_of("algorithm")
        .ok_or_else(|| XpiSigningError::CliBadArgument("--algorithm is required".into()))?
    {
        "ecdsa" => generate_ecdsa_pkcs8(EcdsaCurve::Secp256r1)?,
        "rsa" => {
            let key = RsaPrivateKey::new(&mut OsRng, 2048)
                .map_err(|e| XpiSigningError::KeyGeneration(format!("RSA: {}", e)))?;
            rsa_pkcs8(&key)?
        }
        value => {
            return Err(XpiSigningError::CliBadArgument(format!(
                "unsupported algorithm {}",
                value
            )));
        }
    };
    let key = InMemorySigningKeyPair::from_pkcs8_der(&pkcs8)
        .map_err(|e| XpiSigningError::KeyGeneration(e.to_string()))?;

    let common_name = args
        .value_of("common_name")
        .ok_or_else(|| XpiSigningError::CliBadArgument("--common-name is required".into()))?;
    let validity_days = args
        .value_of("validity_days")
        .ok_or_else(|| XpiSigningError::CliBadArgument("--validity-days is required".into()))?;
    let now = Utc::now();
    let not_after = validity_end(now, validity_days)?;

    let cert = CertificateTemplate::new(not_after - now)
        .validity(now - Duration::minutes(1), not_after)
        .subject_attribute(&OID_COMMON_NAME, common_name)
        .subject_attribute(&OID_ORGANIZATIONAL_UNIT_NAME, "Testing")
        .ca(true)
        .key_usage(KeyUsage::DigitalSignature)
        .key_usage(KeyUsage::KeyCertSign)
        .key_usage(KeyUsage::CrlSign)
        .extended_key_usage(&OID_EKU_PURPOSE_CODE_SIGNING)
        .self_sign(&key)?;

    let cert_pem = cert.encode_pem();
    let key_pem = pem::encode(&pem::Pem {
        tag: "PRIVATE KEY".to_string(),
        contents: pkcs8,
    });

    if let Some(pem_filename) = args.value_of("pem_filename") {
        let cert_path = PathBuf::from(format!("{}.crt", pem_filename));
        let key_path = PathBuf::from(format!("{}.key", pem_filename));

        if let Some(parent) = cert_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        println!("writing issuer certificate to {}", cert_path.display());
        std::fs::write(&cert_path, cert_pem.as_bytes())?;
        println!("writing issuer private key to {}", key_path.display());
        std::fs::write(&key_path, key_pem.as_bytes())?;
    } else {
        print!("{}", cert_pem);
        print!("{}", key_pem);
    }

    Ok(())
}

fn main_impl() -> Result<(), XpiSigningError> {
    let app = Command::new("XPI add-on signing in pure Rust")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Sign and verify XPI add-on archives")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        );

    let app = app.subcommand(
        Command::new("sign")
            .about("Sign an XPI archive")
            .long_about(SIGN_ABOUT)
            .arg(
                Arg::new("config")
                    .long("config")
                    .takes_value(true)
                    .required(true)
                    .help("Path to signer configuration"),
            )
            .arg(
                Arg::new("id")
                    .long("id")
                    .takes_value(true)
                    .help("Add-on identity bound into the end-entity certificate"),
            )
            .arg(
                Arg::new("input")
                    .required(true)
                    .help("Path of XPI to sign"),
            )
            .arg(
                Arg::new("output")
                    .required(true)
                    .help("Path to write signed XPI to"),
            ),
    );

    let app = app.subcommand(
        Command::new("verify")
            .about("Verify the PKCS#7 signature of a signed XPI")
            .long_about(VERIFY_ABOUT)
            .arg(
                Arg::new("trust_anchor")
                    .long("trust-anchor")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .help("PEM file of trusted issuer certificates"),
            )
            .arg(
                Arg::new("print_pem")
                    .long("print-pem")
                    .help("Print the PKCS#7 signature as PEM"),
            )
            .arg(
                Arg::new("input")
                    .required(true)
                    .help("Path of signed XPI"),
            ),
    );

    let app = app.subcommand(
        Command::new("verify-cose")
            .about("Check the structure of the COSE signature of a signed XPI")
            .long_about(VERIFY_COSE_ABOUT)
            .arg(
                Arg::new("algorithm")
                    .long("algorithm")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .help("Expected signature algorithm (PS256, ES256, ES384, ES512)"),
            )
            .arg(
                Arg::new("input")
                    .required(true)
                    .help("Path of signed XPI"),
            ),
    );

    let app = app.subcommand(
        Command::new("print-manifest")
            .about("Print the manifest and signature file that signing would generate")
            .arg(
                Arg::new("input")
                    .required(true)
                    .help("Path of XPI to examine"),
            ),
    );

    let app = app.subcommand(
        Command::new("generate-test-issuer")
            .about("Generate a self-signed issuer certificate for testing")
            .long_about(GENERATE_TEST_ISSUER_ABOUT)
            .arg(
                Arg::new("algorithm")
                    .long("algorithm")
                    .takes_value(true)
                    .possible_values(&["ecdsa", "rsa"])
                    .default_value("ecdsa")
                    .help("Which key type to use"),
            )
            .arg(
                Arg::new("common_name")
                    .long("common-name")
                    .takes_value(true)
                    .default_value("test xpi issuer")
                    .help("Common name of the issuer"),
            )
            .arg(
                Arg::new("validity_days")
                    .long("validity-days")
                    .takes_value(true)
                    .default_value("365")
                    .help("How many days the certificate should be valid for"),
            )
            .arg(
                Arg::new("pem_filename")
                    .long("pem-filename")
                    .takes_value(true)
                    .help("Base name of files to write PEM encoded certificate and key to"),
            ),
    );

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    builder.init();

    match matches.subcommand() {
        Some(("generate-test-issuer", args)) => command_generate_test_issuer(args),
        Some(("print-manifest", args)) => command_print_manifest(args),
        Some(("sign", args)) => command_sign(args),
        Some(("verify", args)) => command_verify(args),
        Some(("verify-cose", args)) => command_verify_cose(args),
        _ => Err(XpiSigningError::CliUnknownCommand),
    }
}

fn main() {
    let exit_code = match main_impl() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {}", err);
            1
        }
    };

    std::process::exit(exit_code)
}

#[cfg(test)]
mod tests {
    use {super::*, chrono::TimeZone};

    #[test]
    fn validity_days() -> Result<(), XpiSigningError> {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        assert_eq!(
            validity_end(now, "30")?,
            Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap()
        );

        for value in ["0", "-5", "ten", "9223372036854775807", "3000000"] {
            assert!(
                matches!(
                    validity_end(now, value),
                    Err(XpiSigningError::CliBadArgument(_))
                ),
                "{}",
                value
            );
        }

        Ok(())
    }
}
