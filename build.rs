use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn main() {
    println!("cargo:rerun-if-changed=manifests/");

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let manifests_root = manifest_dir.join("manifests");
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let output_file = out_dir.join("embedded_manifests.rs");

    // scan every bundle directory, templates included
    let bundles = scan_manifest_bundles(&manifests_root);

    generate_embedded_bundles_code(&bundles, &output_file);
}

const MAX_FILE_SIZE: usize = 2 * 1024 * 1024; // 2 MB

/// collect the files of each manifests/<bundle>/ directory
fn scan_manifest_bundles(manifests_root: &Path) -> BTreeMap<String, Vec<BundleFile>> {
    let mut bundles = BTreeMap::new();

    if !manifests_root.exists() {
        eprintln!(
            "Warning: manifests directory not found at {:?}",
            manifests_root
        );
        return bundles;
    }

    for entry in fs::read_dir(manifests_root).unwrap_or_else(|e| {
        panic!(
            "Failed to read manifests directory {:?}: {}",
            manifests_root, e
        )
    }) {
        let path = entry
            .unwrap_or_else(|e| panic!("Failed to read entry in {:?}: {}", manifests_root, e))
            .path();

        if !path.is_dir() {
            continue;
        }

        let bundle_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_else(|| panic!("Invalid bundle directory name: {:?}", path))
            .to_string();

        let mut files = Vec::new();
        for file_entry in fs::read_dir(&path)
            .unwrap_or_else(|e| panic!("Failed to read bundle directory {:?}: {}", path, e))
        {
            let file_path = file_entry
                .unwrap_or_else(|e| panic!("Failed to read file entry in {:?}: {}", path, e))
                .path();

            if !file_path.is_file() {
                continue;
            }

            let filename = file_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_else(|| panic!("Invalid filename: {:?}", file_path))
                .to_string();

            let contents = fs::read(&file_path)
                .unwrap_or_else(|e| panic!("Failed to read file {:?}: {}", file_path, e));

            if contents.len() > MAX_FILE_SIZE {
                panic!(
                    "Manifest {:?} is {} bytes, exceeds max size of {} bytes",
                    file_path,
                    contents.len(),
                    MAX_FILE_SIZE
                );
            }

            // manifests are applied as UTF-8 text, anything else is a packaging mistake
            if !is_likely_text(&contents) || std::str::from_utf8(&contents).is_err() {
                panic!("Manifest {:?} is not UTF-8 text", file_path);
            }

            files.push(BundleFile { filename, contents });
        }

        // deterministic apply order inside a bundle
        files.sort_by(|a, b| a.filename.cmp(&b.filename));

        if !files.is_empty() {
            eprintln!("  {}: {} files", bundle_name, files.len());
            bundles.insert(bundle_name, files);
        }
    }

    bundles
}

struct BundleFile {
    filename: String,
    contents: Vec<u8>,
}

/// null bytes or mostly unprintable content means binary
fn is_likely_text(data: &[u8]) -> bool {
    let sample_size = std::cmp::min(512, data.len());
    if sample_size == 0 {
        return true;
    }
    let sample = &data[..sample_size];

    if sample.contains(&0) {
        return false;
    }

    let printable_count = sample
        .iter()
        .filter(|&&b| (32..=126).contains(&b) || b == b'\n' || b == b'\r' || b == b'\t' || b >= 128)
        .count();

    printable_count as f64 / sample_size as f64 > 0.95
}

fn generate_embedded_bundles_code(bundles: &BTreeMap<String, Vec<BundleFile>>, output: &Path) {
    let mut code = String::new();

    code.push_str("// Auto-generated by build.rs - DO NOT EDIT\n");
    code.push_str("use std::collections::HashMap;\n");
    code.push_str("use once_cell::sync::Lazy;\n\n");

    code.push_str("/// Embedded manifest file: (filename, base64_content)\n");
    code.push_str("pub type EmbeddedManifestFile = (&'static str, &'static str);\n\n");

    code.push_str("/// Embedded manifest bundles keyed by directory name under manifests/\n");
    code.push_str("pub static EMBEDDED_BUNDLES: Lazy<HashMap<&'static str, &'static [EmbeddedManifestFile]>> = Lazy::new(|| {\n");
    code.push_str("    let mut map = HashMap::new();\n\n");

    for (bundle_name, files) in bundles {
        let array_name = format!(
            "BUNDLE_{}",
            bundle_name
                .to_uppercase()
                .chars()
                .map(|c| if c.is_alphanumeric() { c } else { '_' })
                .collect::<String>()
        );

        code.push_str(&format!(
            "    static {}: &[EmbeddedManifestFile] = &[\n",
            array_name
        ));
        for file in files {
            code.push_str(&format!(
                "        (\"{}\", \"{}\"),\n",
                file.filename,
                base64_encode(&file.contents)
            ));
        }
        code.push_str("    ];\n");
        code.push_str(&format!(
            "    map.insert(\"{}\", {});\n\n",
            bundle_name, array_name
        ));
    }

    code.push_str("    map\n");
    code.push_str("});\n\n");

    code.push_str("/// Files of one bundle, sorted by filename\n");
    code.push_str(
        "pub fn bundle_files(bundle: &str) -> Option<&'static [EmbeddedManifestFile]> {\n",
    );
    code.push_str("    EMBEDDED_BUNDLES.get(bundle).copied()\n");
    code.push_str("}\n\n");

    code.push_str("/// Names of all embedded bundles\n");
    code.push_str("pub fn bundle_names() -> Vec<&'static str> {\n");
    code.push_str("    let mut names: Vec<&'static str> = EMBEDDED_BUNDLES.keys().copied().collect();\n");
    code.push_str("    names.sort();\n");
    code.push_str("    names\n");
    code.push_str("}\n");

    fs::write(output, code).expect("failed to write embedded manifests code");
}

fn base64_encode(data: &[u8]) -> String {
    use base64::{Engine as _, engine::general_purpose};
    general_purpose::STANDARD.encode(data)
}
