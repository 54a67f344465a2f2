use divan::{Bencher, black_box};
use reheat::{Document, DocumentOptions, LoadOptions};

fn main() {
    divan::main();
}

/// A page with every kind of content the load pipeline rewrites.
fn page(sections: usize) -> Vec<u8> {
    let mut html = String::from(
        "<!DOCTYPE html PUBLIC \"-//W3C//DTD XHTML 1.0 Strict//EN\">\
         <html><head><meta charset=\"utf-8\"><title>Bench</title>\
         <noscript><link rel=stylesheet href=fallback.css></noscript></head><body>",
    );
    for i in 0..sections {
        html.push_str(&format!(
            "<section id=\"s{i}\"><h2>Section {i}</h2>\
             <p>Some <b>text</b> with a line<br>break and an image <img src=\"img{i}.png\"></p>\
             <amp-img [src]=\"state.img{i}\" layout=\"fill\" />\
             <template type=\"amp-mustache\"><a href=\"{{{{url{i}}}}}\">{{{{title}}}}</a></template>\
             </section>"
        ));
    }
    html.push_str("</body></html>");
    html.into_bytes()
}

fn document() -> Document {
    Document::new(DocumentOptions::new().seed(42))
}

#[divan::bench(args = [10, 100, 1000])]
fn load(bencher: Bencher, sections: usize) {
    let html = page(sections);
    bencher.bench_local(|| {
        let mut doc = document();
        doc.load(black_box(&html), &LoadOptions::default());
        black_box(doc);
    });
}

#[divan::bench(args = [10, 100, 1000])]
fn save(bencher: Bencher, sections: usize) {
    let mut doc = document();
    doc.load(&page(sections), &LoadOptions::default());
    bencher.bench_local(|| {
        let html = doc.save(None).unwrap();
        black_box(html);
    });
}

#[divan::bench(args = [10, 100, 1000])]
fn load_then_save(bencher: Bencher, sections: usize) {
    let html = page(sections);
    bencher.bench_local(|| {
        let mut doc = document();
        doc.load(black_box(&html), &LoadOptions::default());
        black_box(doc.save(None).unwrap());
    });
}
